//! Build pipeline: recipe in, published image out.
//!
//! One `build()` drives one recipe through four stages — container setup,
//! rootfs customization, image packaging, publish — and unwinds staged
//! state in reverse order of acquisition on every exit path. The working
//! container never outlives a failed build; teardown failures are logged,
//! not re-reported, except for the package-manager cleanup after an
//! otherwise successful build.

use std::fs;
use std::path::{Path, PathBuf};

use pxeforge_core::error::{ForgeError, Result};
use pxeforge_core::exec;
use pxeforge_core::recipe::{BuildRecipe, CommandStep};

use crate::backend::ContainerBackend;
use crate::oci::archive::load_docker_archive;
use crate::oci::assembler::INITRD_LAYER_COMMENT;
use crate::oci::ImageAssembler;
use crate::pkgmgr::{self, PackageManager};

/// Orchestrates one image build.
#[derive(Debug)]
pub struct BuildPipeline {
    recipe: BuildRecipe,
    work_dir: PathBuf,
    backend: ContainerBackend,
    pkg_mgr: Box<dyn PackageManager>,
    create_squashfs: bool,
    create_initrd: bool,
}

impl BuildPipeline {
    /// Validate the recipe, resolve the package manager and prepare a
    /// pipeline. Unsupported recipes fail here, before any work starts.
    pub fn new(
        recipe: BuildRecipe,
        work_dir: impl Into<PathBuf>,
        create_squashfs: bool,
        create_initrd: bool,
    ) -> Result<Self> {
        recipe.validate()?;
        let pkg_mgr = pkgmgr::for_kind(&recipe.options.pkg_manager)?;
        let backend = ContainerBackend::new(
            recipe.options.registry_opts_pull.clone(),
            recipe.options.registry_opts_push.clone(),
        );

        Ok(Self {
            recipe,
            work_dir: work_dir.into(),
            backend,
            pkg_mgr,
            create_squashfs,
            create_initrd,
        })
    }

    /// Run the build to completion.
    pub async fn build(&self) -> Result<()> {
        tracing::info!("Starting image build process");

        tracing::info!("--> Setting up container");
        let (container, mount_point) = self.setup_container()?;
        tracing::info!(container = %container, mount = %mount_point.display(), "Container mounted");

        let outcome = self.run_stages(&container, &mount_point).await;

        // The working container is torn down on every exit path; a
        // teardown failure is logged rather than masking the build result.
        if let Err(e) = self.backend.cleanup(&container) {
            tracing::warn!(container = %container, error = %e, "Failed to tear down working container");
        }

        if outcome.is_ok() {
            tracing::info!("Image build completed successfully");
        }
        outcome
    }

    async fn run_stages(&self, container: &str, mount_point: &Path) -> Result<()> {
        tracing::info!("--> Customizing container");
        self.customize_container(container, mount_point)?;

        tracing::info!("--> Packaging final image");
        let mut image = self.package_image(container, mount_point).await?;

        let push_result = if self.recipe.options.publish_registry.is_empty() {
            Ok(())
        } else {
            tracing::info!("--> Pushing image to registry");
            image
                .push()
                .await
                .map_err(|e| ForgeError::Other(format!("failed to push image: {e}")))
        };

        tracing::info!("--> Cleaning up build artifacts");
        image.cleanup();
        push_result?;

        self.pkg_mgr
            .cleanup(mount_point)
            .map_err(|e| ForgeError::Other(format!("failed to cleanup rootfs: {e}")))?;

        Ok(())
    }

    /// Produce a mounted working container, from the parent image when
    /// one is configured, from scratch otherwise.
    fn setup_container(&self) -> Result<(String, PathBuf)> {
        if self.recipe.has_parent() {
            let parent = self.recipe.options.parent.as_str();
            tracing::info!(parent, "Pulling parent image");
            self.backend
                .pull_parent(parent)
                .map_err(|e| ForgeError::Other(format!("failed to pull parent image: {e}")))?;

            tracing::info!("Mounting parent image");
            let container = self.backend.create_from_image(parent)?;
            let mount_point = self.backend.mount(&container)?;
            Ok((container, mount_point))
        } else {
            tracing::info!("Starting from scratch");
            let container = self
                .backend
                .create_from_scratch()
                .map_err(|e| ForgeError::Other(format!("failed to create container: {e}")))?;
            let mount_point = self.backend.mount(&container)?;
            Ok((container, mount_point))
        }
    }

    /// Populate the rootfs: packages, copied files, post-install commands.
    fn customize_container(&self, container: &str, mount_point: &Path) -> Result<()> {
        let recipe = &self.recipe;

        if !recipe.packages.is_empty() || !recipe.package_groups.is_empty() {
            tracing::info!("Initializing rootfs with package manager");
            self.pkg_mgr
                .init_rootfs(mount_point, recipe)
                .map_err(|e| ForgeError::Other(format!("failed to initialize rootfs: {e}")))?;

            tracing::info!("Adding repositories");
            self.pkg_mgr
                .add_repos(mount_point, &recipe.repositories)
                .map_err(|e| ForgeError::Other(format!("failed to add repositories: {e}")))?;

            tracing::info!("Installing packages and groups");
            self.pkg_mgr
                .install_packages(mount_point, &recipe.packages, &recipe.package_groups)
                .map_err(|e| ForgeError::Other(format!("failed to install packages: {e}")))?;
        } else {
            tracing::info!("Skipping package manager setup as no packages are defined");
        }

        if !recipe.copy_files.is_empty() {
            tracing::info!("Copying files into rootfs");
            self.pkg_mgr.copy_files(mount_point, &recipe.copy_files)?;
        }

        for cmd in &recipe.cmds {
            announce_command(cmd);
            self.pkg_mgr
                .run_script(&self.backend, container, &cmd.command)
                .map_err(|e| {
                    ForgeError::Other(format!("failed to run command '{}': {e}", cmd.command))
                })?;
        }

        Ok(())
    }

    /// Assemble the OCI image from the customized rootfs, seeding from
    /// the parent image when one is configured.
    async fn package_image(&self, container: &str, mount_point: &Path) -> Result<ImageAssembler> {
        let kernel_version = if self.create_initrd {
            self.kernel_version(container)?
        } else {
            String::new()
        };

        let (seed, archive_path) = if self.recipe.has_parent() {
            let parent = self.recipe.options.parent.as_str();
            tracing::info!(parent, "Loading parent image from local storage");

            // The archive lives under the work dir to ensure adequate
            // space, and persists until the composer's final cleanup.
            let archive_path = self.create_parent_archive_file()?;
            if let Err(e) = self.backend.save_image_to_archive(parent, &archive_path) {
                let _ = fs::remove_file(&archive_path);
                return Err(ForgeError::Other(format!(
                    "failed to save parent image to archive: {e}"
                )));
            }

            match load_docker_archive(&archive_path) {
                Ok(seed) => (Some(seed), Some(archive_path)),
                Err(e) => {
                    let _ = fs::remove_file(&archive_path);
                    return Err(ForgeError::Other(format!(
                        "failed to load parent image from archive: {e}"
                    )));
                }
            }
        } else {
            (None, None)
        };

        tracing::info!("Creating OCI image with layers");
        let mut image = ImageAssembler::new(
            &self.recipe.options.publish_registry,
            &self.recipe.options.name,
            self.recipe.clone(),
            seed,
            archive_path,
        );

        if let Err(e) = self.assemble_layers(&mut image, container, mount_point, &kernel_version)
        {
            image.cleanup();
            return Err(e);
        }
        Ok(image)
    }

    fn assemble_layers(
        &self,
        image: &mut ImageAssembler,
        container: &str,
        mount_point: &Path,
        kernel_version: &str,
    ) -> Result<()> {
        image
            .add_base_layer(mount_point)
            .map_err(|e| ForgeError::Other(format!("failed to add base layer: {e}")))?;
        image
            .add_config_layer()
            .map_err(|e| ForgeError::Other(format!("failed to add config layer: {e}")))?;

        if self.create_initrd {
            let mut initrd_path = None;
            if image.has_layer_with_comment(INITRD_LAYER_COMMENT) {
                tracing::info!("Found initrd layer in parent image, skipping generation");
            } else {
                tracing::info!("Parent does not have an initrd layer, generating a new one");
                self.generate_initrd(container, kernel_version)?;
                initrd_path = Some(self.find_generated_initrd(mount_point, kernel_version)?);
            }

            // The kernel only has to leave the container on scratch
            // builds; parent builds reuse the parent's kernel layer.
            if !self.recipe.has_parent() {
                tracing::info!("Extracting kernel for scratch build");
                self.extract_kernel(container, kernel_version)?;
            }

            let kernel_path = self.work_dir.join("kernel");
            image
                .add_kernel_layer(&kernel_path, kernel_version)
                .map_err(|e| ForgeError::Other(format!("failed to add kernel layer: {e}")))?;
            image
                .add_initrd_layer(initrd_path.as_deref())
                .map_err(|e| ForgeError::Other(format!("failed to add initrd layer: {e}")))?;
        }

        if self.create_squashfs {
            tracing::info!("Creating squashfs image");
            self.create_squashfs_artifact(mount_point)?;
        }

        Ok(())
    }

    /// Ask the container which kernel it carries: the first entry of
    /// `/lib/modules`.
    fn kernel_version(&self, container: &str) -> Result<String> {
        tracing::debug!(container, "Querying kernel version from container");
        let output = self
            .backend
            .run_with_output(container, "ls /lib/modules")
            .map_err(|e| {
                ForgeError::Other(format!("failed to list /lib/modules in container: {e}"))
            })?;

        first_nonempty_line(&output).ok_or_else(|| {
            ForgeError::Lookup(
                "could not determine kernel version: /lib/modules is empty or does not exist in container"
                    .to_string(),
            )
        })
    }

    fn generate_initrd(&self, container: &str, kernel_version: &str) -> Result<()> {
        let dracut_cmd = format!(
            "dracut --add \"dmsquash-live livenet network-manager\" --kver {kernel_version} -N -f --logfile /tmp/dracut.log 2>/dev/null"
        );
        self.pkg_mgr
            .run_script(&self.backend, container, &dracut_cmd)
            .map_err(|e| ForgeError::Other(format!("failed to run dracut: {e}")))?;

        self.pkg_mgr
            .run_script(&self.backend, container, "echo DRACUT LOG:; cat /tmp/dracut.log")
            .map_err(|e| ForgeError::Other(format!("failed to show dracut log: {e}")))?;
        Ok(())
    }

    /// Locate the initrd dracut just wrote under the mounted rootfs.
    fn find_generated_initrd(&self, mount_point: &Path, kernel_version: &str) -> Result<PathBuf> {
        let versioned = mount_point
            .join("boot")
            .join(format!("initramfs-{kernel_version}.img"));
        if versioned.exists() {
            return Ok(versioned);
        }
        let fallback = mount_point.join("boot/initrd.img");
        if fallback.exists() {
            return Ok(fallback);
        }
        Err(ForgeError::Lookup(format!(
            "failed to find initrd file after generating it (looked for {} and {})",
            versioned.display(),
            fallback.display()
        )))
    }

    /// Probe the container for the kernel image and deposit it at
    /// `<workDir>/kernel`.
    fn extract_kernel(&self, container: &str, kernel_version: &str) -> Result<()> {
        let candidates = [
            format!("/boot/vmlinuz-{kernel_version}"),
            format!("/lib/modules/{kernel_version}/vmlinuz"),
        ];

        let mut kernel_in_container = None;
        for candidate in &candidates {
            tracing::debug!(path = candidate, "Checking for kernel in container");
            if self.backend.stat(container, candidate).is_ok() {
                tracing::debug!(path = candidate, "Found kernel in container");
                kernel_in_container = Some(candidate.as_str());
                break;
            }
        }
        let kernel_in_container = kernel_in_container.ok_or_else(|| {
            ForgeError::Lookup(format!(
                "could not find kernel in container for version '{kernel_version}' in paths: {candidates:?}"
            ))
        })?;

        fs::create_dir_all(&self.work_dir).map_err(|e| {
            ForgeError::Other(format!("failed to create output directory for kernel: {e}"))
        })?;
        let dst = self.work_dir.join("kernel");
        tracing::debug!(src = kernel_in_container, dst = %dst.display(), "Copying kernel from container");
        self.backend
            .copy_out_file(container, kernel_in_container, &dst)
            .map_err(|e| {
                ForgeError::Other(format!("failed to copy kernel from container: {e}"))
            })?;
        Ok(())
    }

    fn create_parent_archive_file(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.work_dir).map_err(ForgeError::Io)?;
        let (_file, path) = tempfile::Builder::new()
            .prefix("parent-image-")
            .suffix(".tar")
            .tempfile_in(&self.work_dir)
            .map_err(|e| {
                ForgeError::Other(format!("failed to create temporary archive file: {e}"))
            })?
            .keep()
            .map_err(|e| {
                ForgeError::Other(format!("failed to persist temporary archive file: {e}"))
            })?;
        Ok(path)
    }

    fn create_squashfs_artifact(&self, mount_point: &Path) -> Result<()> {
        let output_path = self.work_dir.join("image.squashfs");
        let args: Vec<String> = vec![
            mount_point.display().to_string(),
            output_path.display().to_string(),
            "-comp".to_string(),
            "xz".to_string(),
            "-no-progress".to_string(),
        ];
        exec::run_captured("mksquashfs", &args)
            .map_err(|e| ForgeError::Other(format!("mksquashfs failed: {e}")))?;
        Ok(())
    }
}

/// Announce a post-install command at its configured log level.
fn announce_command(cmd: &CommandStep) {
    let level = cmd.announce_level();
    if level == tracing::Level::DEBUG {
        tracing::debug!(command = %cmd.command, "Running command");
    } else if level == tracing::Level::WARN {
        tracing::warn!(command = %cmd.command, "Running command");
    } else if level == tracing::Level::ERROR {
        tracing::error!(command = %cmd.command, "Running command");
    } else {
        tracing::info!(command = %cmd.command, "Running command");
    }
}

/// First non-empty, trimmed line of a command's output.
fn first_nonempty_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
