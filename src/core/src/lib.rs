//! Shared foundation for the pxeforge image builder.
//!
//! Carries the pieces every other crate needs: the error type, the YAML
//! build recipe model, and the subprocess helpers used to drive external
//! tools (container engine, package manager, archivers).

pub mod error;
pub mod exec;
pub mod recipe;

pub use error::{ForgeError, Result};
pub use recipe::{BuildRecipe, CommandStep, CopyFile, Repository};
