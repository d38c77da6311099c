//! Package-manager adapters.
//!
//! One implementation per recognized `pkg_manager` kind. The contract is
//! split two ways: rootfs preparation, repo configuration, installs,
//! copy-in and cleanup operate on a host-side rootfs path, while script
//! execution goes through the container backend so commands run inside the
//! working container.

mod dnf;

pub use dnf::DnfManager;

use std::path::Path;

use pxeforge_core::error::{ForgeError, Result};
use pxeforge_core::recipe::{BuildRecipe, CopyFile, Repository};

use crate::backend::ContainerBackend;

/// Operations a package manager must provide to the build pipeline.
pub trait PackageManager: Send + Sync + std::fmt::Debug {
    /// Prepare `root` as an installable target: skeleton directories, DNS
    /// resolution, repo descriptors, and a minimal bootstrap install.
    fn init_rootfs(&self, root: &Path, recipe: &BuildRecipe) -> Result<()>;

    /// Write repository descriptor files under `root`. An empty list is a
    /// no-op.
    fn add_repos(&self, root: &Path, repos: &[Repository]) -> Result<()>;

    /// Install packages and package groups into `root`.
    fn install_packages(&self, root: &Path, packages: &[String], groups: &[String])
        -> Result<()>;

    /// Run a shell command inside the working container.
    fn run_script(
        &self,
        backend: &ContainerBackend,
        container: &str,
        command: &str,
    ) -> Result<()>;

    /// Copy host files into `root` with attribute preservation.
    fn copy_files(&self, root: &Path, files: &[CopyFile]) -> Result<()>;

    /// Drop caches and logs from `root` after the build.
    fn cleanup(&self, root: &Path) -> Result<()>;
}

/// Resolve a package manager implementation for a recipe kind.
///
/// Unknown kinds are a configuration error surfaced at pipeline
/// construction so unsupported recipes fail before any work starts.
pub fn for_kind(kind: &str) -> Result<Box<dyn PackageManager>> {
    match kind {
        "dnf" => Ok(Box::new(DnfManager::default())),
        "zypper" => Err(ForgeError::Other(
            "zypper support is not implemented yet".to_string(),
        )),
        "apt" => Err(ForgeError::Other(
            "apt support is not implemented yet".to_string(),
        )),
        other => Err(ForgeError::InvalidRecipe {
            field: "options.pkg_manager".to_string(),
            message: format!("unsupported package manager '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_kind_dnf() {
        assert!(for_kind("dnf").is_ok());
    }

    #[test]
    fn test_for_kind_recognized_but_unimplemented() {
        assert!(for_kind("zypper").is_err());
        assert!(for_kind("apt").is_err());
    }

    #[test]
    fn test_for_kind_unknown() {
        let err = for_kind("portage").unwrap_err();
        assert_eq!(
            err.to_string(),
            "options.pkg_manager: unsupported package manager 'portage'"
        );
    }
}
