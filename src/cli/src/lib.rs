//! pxeforge command-line interface.

pub mod commands;
pub mod output;
