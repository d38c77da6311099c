//! DNF package manager adapter.
//!
//! Bootstraps the rootfs with the host's dnf (`--installroot`), then
//! installs packages and groups through a chroot into the rootfs. The
//! adapter owns the rootfs exclusively while an operation runs and is not
//! reentrant against the same root.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use pxeforge_core::error::{ForgeError, Result};
use pxeforge_core::exec;
use pxeforge_core::recipe::{BuildRecipe, CopyFile, Repository};

use crate::backend::ContainerBackend;

use super::PackageManager;

// TODO: read the release version from the recipe options once the schema
// grows a release_version field.
const RELEASE_VERSION: &str = "9";

/// Minimal package set that makes a rootfs installable.
const BOOTSTRAP_PACKAGES: [&str; 8] = [
    "dnf",
    "yum",
    "systemd",
    "filesystem",
    "setup",
    "shadow-utils",
    "rootfiles",
    "bash",
];

/// Skeleton directories a dnf-managed rootfs needs before the first
/// install.
const SKELETON_DIRS: [&str; 7] = [
    "etc/yum.repos.d",
    "var/log/dnf",
    "var/cache/dnf",
    "etc/pki/rpm-gpg",
    "var/lib/rpm",
    "var/lib/dnf",
    "etc/dnf",
];

/// Directories emptied during cleanup.
const CLEANUP_DIRS: [&str; 3] = ["var/cache/dnf", "var/log", "tmp"];

/// DNF-backed package manager.
#[derive(Debug, Clone)]
pub struct DnfManager {
    dnf_program: String,
    chroot_program: String,
}

impl Default for DnfManager {
    fn default() -> Self {
        Self {
            dnf_program: "dnf".to_string(),
            chroot_program: "chroot".to_string(),
        }
    }
}

impl DnfManager {
    /// Adapter pointed at arbitrary dnf/chroot binaries. Used by tests to
    /// substitute stub executables.
    #[allow(dead_code)]
    pub(crate) fn with_programs(
        dnf_program: impl Into<String>,
        chroot_program: impl Into<String>,
    ) -> Self {
        Self {
            dnf_program: dnf_program.into(),
            chroot_program: chroot_program.into(),
        }
    }

    fn chroot_install(&self, root: &Path, verb_args: &[&str], items: &[String]) -> Result<()> {
        let mut args: Vec<String> = vec![
            root.display().to_string(),
            "dnf".to_string(),
            "--assumeyes".to_string(),
            "--setopt=install_weak_deps=False".to_string(),
        ];
        args.extend(verb_args.iter().map(|s| s.to_string()));
        args.extend(items.iter().cloned());

        exec::run_streaming(&self.chroot_program, &args, |line| {
            if is_install_progress(line) {
                tracing::info!("{line}");
            }
        })
        .map_err(|e| ForgeError::Package(format!("install failed: {e}")))?;
        Ok(())
    }
}

impl PackageManager for DnfManager {
    fn init_rootfs(&self, root: &Path, recipe: &BuildRecipe) -> Result<()> {
        tracing::info!(root = %root.display(), "Installing dnf into rootfs");

        for dir in SKELETON_DIRS {
            create_dir_0755(&root.join(dir))?;
        }

        // DNS resolution inside the rootfs during installs.
        let resolv_conf = Path::new("/etc/resolv.conf");
        if resolv_conf.exists() {
            link_or_copy(resolv_conf, &root.join("etc/resolv.conf"))?;
        }

        self.add_repos(root, &recipe.repositories)?;

        let mut args: Vec<String> = vec![
            "--installroot".to_string(),
            root.display().to_string(),
            "--releasever".to_string(),
            RELEASE_VERSION.to_string(),
            "install".to_string(),
            "--assumeyes".to_string(),
            "--setopt=install_weak_deps=False".to_string(),
        ];
        args.extend(BOOTSTRAP_PACKAGES.iter().map(|p| p.to_string()));

        exec::run_captured(&self.dnf_program, &args)
            .map_err(|e| ForgeError::Package(format!("failed to bootstrap dnf: {e}")))?;
        Ok(())
    }

    fn add_repos(&self, root: &Path, repos: &[Repository]) -> Result<()> {
        if repos.is_empty() {
            tracing::debug!("No repositories to add");
            return Ok(());
        }

        let repo_dir = root.join("etc/yum.repos.d");
        create_dir_0755(&repo_dir)?;

        for repo in repos {
            tracing::debug!(alias = %repo.alias, "Adding repository");
            let path = repo_dir.join(format!("{}.repo", repo.alias));
            fs::write(&path, repo_descriptor(repo)).map_err(|e| {
                ForgeError::Other(format!(
                    "failed to write repo file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
                .map_err(ForgeError::Io)?;
        }

        Ok(())
    }

    fn install_packages(
        &self,
        root: &Path,
        packages: &[String],
        groups: &[String],
    ) -> Result<()> {
        create_dir_0755(&root.join("var/cache/dnf"))?;

        if !packages.is_empty() {
            tracing::info!(count = packages.len(), "Installing packages");
            self.chroot_install(root, &["install"], packages)?;
        }

        if !groups.is_empty() {
            tracing::info!(count = groups.len(), "Installing package groups");
            self.chroot_install(root, &["group", "install"], groups)?;
        }

        Ok(())
    }

    fn run_script(
        &self,
        backend: &ContainerBackend,
        container: &str,
        command: &str,
    ) -> Result<()> {
        tracing::info!(command, "Running command");
        backend
            .run_streaming(container, command, |line| {
                if is_script_progress(line) {
                    tracing::info!("{line}");
                }
            })
            .map_err(|e| ForgeError::Package(format!("command '{command}' failed: {e}")))?;
        Ok(())
    }

    fn copy_files(&self, root: &Path, files: &[CopyFile]) -> Result<()> {
        for file in files {
            let src = Path::new(&file.src);
            if !src.exists() {
                return Err(ForgeError::Lookup(format!(
                    "copy source '{}' does not exist",
                    file.src
                )));
            }

            let dest = join_under_root(root, &file.dest);
            if let Some(parent) = dest.parent() {
                create_dir_0755(parent)?;
            }

            // -a preserves all file attributes.
            let mut args: Vec<String> = vec!["-a".to_string()];
            args.extend(file.opts.iter().cloned());
            args.push(file.src.clone());
            args.push(dest.display().to_string());

            exec::run_captured("cp", &args)?;
        }
        Ok(())
    }

    fn cleanup(&self, root: &Path) -> Result<()> {
        let args: Vec<String> = vec![
            "--installroot".to_string(),
            root.display().to_string(),
            "clean".to_string(),
            "all".to_string(),
        ];
        exec::run_captured(&self.dnf_program, &args)
            .map_err(|e| ForgeError::Package(format!("failed to clean dnf cache: {e}")))?;

        for dir in CLEANUP_DIRS {
            empty_dir(&root.join(dir))?;
        }
        Ok(())
    }
}

/// Render a repo descriptor file for a repository entry.
fn repo_descriptor(repo: &Repository) -> String {
    let mut content = format!(
        "[{alias}]\nname={alias}\nbaseurl={url}\nenabled=1\ngpgcheck=0\n",
        alias = repo.alias,
        url = repo.url
    );
    if repo.priority > 0 {
        content.push_str(&format!("priority={}\n", repo.priority));
    }
    content
}

/// Progress lines worth surfacing from package and group installs.
fn is_install_progress(line: &str) -> bool {
    ["Installing", "Downloading", "Verifying", "Running"]
        .iter()
        .any(|keyword| line.contains(keyword))
}

/// Progress lines worth surfacing from arbitrary post-install commands.
fn is_script_progress(line: &str) -> bool {
    ["Progress", "Installing", "Downloading", "Running"]
        .iter()
        .any(|keyword| line.contains(keyword))
}

/// Join a (possibly absolute) destination path under the rootfs.
fn join_under_root(root: &Path, dest: &str) -> PathBuf {
    root.join(dest.trim_start_matches('/'))
}

fn create_dir_0755(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        ForgeError::Other(format!("failed to create directory {}: {}", dir.display(), e))
    })?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).map_err(ForgeError::Io)?;
    Ok(())
}

/// Hard-link `src` to `dst`, copying instead when linking fails (different
/// filesystems, most commonly).
fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        fs::remove_file(dst).map_err(ForgeError::Io)?;
    }
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map_err(|e| {
        ForgeError::Other(format!(
            "failed to copy {} to {}: {}",
            src.display(),
            dst.display(),
            e
        ))
    })?;
    Ok(())
}

/// Remove the contents of a directory, keeping the directory itself. A
/// missing directory is fine.
fn empty_dir(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ForgeError::Io(e)),
    };
    for entry in entries {
        let entry = entry.map_err(ForgeError::Io)?;
        let path = entry.path();
        if entry.file_type().map_err(ForgeError::Io)?.is_dir() {
            fs::remove_dir_all(&path).map_err(ForgeError::Io)?;
        } else {
            fs::remove_file(&path).map_err(ForgeError::Io)?;
        }
    }
    Ok(())
}
