//! Image build pipeline for pxeforge.
//!
//! Turns a build recipe into a published OCI image in four stages:
//!
//! 1. The [`backend::ContainerBackend`] drives a `buildah`-class engine to
//!    produce a mounted working container (rootful or rootless).
//! 2. A [`pkgmgr::PackageManager`] populates the mounted rootfs from
//!    distribution repositories and runs post-install commands.
//! 3. The [`oci::ImageAssembler`] wraps the rootfs plus kernel, initrd and
//!    recipe into a multi-layer OCI image, reusing parent layers by their
//!    history comments where possible.
//! 4. The assembler pushes the image to a registry under one or more tags.
//!
//! [`pipeline::BuildPipeline`] sequences the stages and unwinds staged
//! state on every exit path.

pub mod backend;
pub mod oci;
pub mod pipeline;
pub mod pkgmgr;

pub use backend::ContainerBackend;
pub use oci::ImageAssembler;
pub use pipeline::BuildPipeline;
pub use pkgmgr::PackageManager;
