//! Container backend adapter: drives a `buildah`-class build engine.
//!
//! Every operation shells out to the engine binary. When the effective uid
//! is non-zero the command line is prefixed with a user-namespace entry
//! helper, so the same adapter works rootful and rootless; the choice is
//! made per invocation and never cached as global state.
//!
//! Container names and mount points are returned to the caller rather than
//! held here — the working container is pipeline-local state.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use pxeforge_core::error::{ForgeError, Result};
use pxeforge_core::exec;
use pxeforge_core::recipe::SCRATCH;

/// The external build engine binary.
const ENGINE: &str = "buildah";

/// User-namespace entry helper prepended for rootless invocations.
const USERNS_HELPER: &str = "unshare";

/// Prefix for time-seeded working container names.
const CONTAINER_NAME_PREFIX: &str = "pxeforge";

/// Adapter over the external container build engine.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    program: String,
    rootless: bool,
    pull_opts: Vec<String>,
    push_opts: Vec<String>,
}

impl ContainerBackend {
    /// Create a backend using the system engine, detecting rootless mode
    /// from the effective uid.
    pub fn new(pull_opts: Vec<String>, push_opts: Vec<String>) -> Self {
        Self {
            program: ENGINE.to_string(),
            rootless: !nix::unistd::geteuid().is_root(),
            pull_opts,
            push_opts,
        }
    }

    /// Backend pointed at an arbitrary engine binary. Used by tests to
    /// substitute a stub executable.
    #[allow(dead_code)]
    pub(crate) fn with_program(
        program: impl Into<String>,
        rootless: bool,
        pull_opts: Vec<String>,
        push_opts: Vec<String>,
    ) -> Self {
        Self {
            program: program.into(),
            rootless,
            pull_opts,
            push_opts,
        }
    }

    /// Compose the actual (program, argv) pair for an engine invocation,
    /// applying the rootless prefix when needed.
    fn invocation(&self, args: &[String]) -> (String, Vec<String>) {
        if self.rootless {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(self.program.clone());
            full.extend_from_slice(args);
            (USERNS_HELPER.to_string(), full)
        } else {
            (self.program.clone(), args.to_vec())
        }
    }

    /// Run an engine command, returning its stdout.
    fn execute(&self, args: &[String]) -> Result<String> {
        let (program, argv) = self.invocation(args);
        exec::run_captured(&program, &argv)
    }

    /// Run a best-effort engine command; failures are logged at debug and
    /// swallowed.
    fn execute_best_effort(&self, args: &[String]) {
        if let Err(e) = self.execute(args) {
            tracing::debug!(error = %e, "Best-effort engine command failed");
        }
    }

    /// Remove any stale working containers the engine still knows about.
    fn sweep_stale_containers(&self) {
        let list = match self.execute(&args(&["containers", "--format", "{{.ContainerID}}"])) {
            Ok(out) => out,
            Err(e) => {
                tracing::debug!(error = %e, "Could not list stale containers");
                return;
            }
        };
        for container in list.lines().map(str::trim).filter(|c| !c.is_empty()) {
            tracing::debug!(container, "Cleaning up stale container");
            self.execute_best_effort(&args(&["rm", container]));
        }
    }

    /// Make sure the parent image is present in local engine storage.
    ///
    /// An empty or `scratch` parent needs no action. A locally present
    /// image is used as-is — the local cache is authoritative and no
    /// network fetch happens. Only an absent image is pulled, with the
    /// caller-supplied pull options, and re-verified afterwards.
    pub fn pull_parent(&self, parent: &str) -> Result<()> {
        if parent.is_empty() || parent == SCRATCH {
            tracing::info!("No parent image specified, starting from scratch");
            return Ok(());
        }

        tracing::info!(parent, "Checking for local parent image");
        let inspect = args(&["inspect", "--type=image", parent]);
        if self.execute(&inspect).is_ok() {
            tracing::info!(parent, "Parent image found locally, using it");
            tracing::debug!("To force a refresh, remove the local image manually before running");
            return Ok(());
        }

        tracing::info!(parent, "Parent image not found locally, pulling from registry");
        self.sweep_stale_containers();
        self.execute_best_effort(&args(&["prune", "-f"]));

        let mut pull = vec!["pull".to_string()];
        pull.extend(self.pull_opts.iter().cloned());
        pull.push(parent.to_string());
        self.execute(&pull)?;

        tracing::debug!(parent, "Verifying parent image exists locally after pull");
        self.execute(&inspect).map_err(|e| {
            ForgeError::Other(format!(
                "failed to inspect parent image '{parent}' after pulling: {e}"
            ))
        })?;

        tracing::info!(parent, "Successfully pulled parent image");
        Ok(())
    }

    /// Create a fresh working container from `scratch` with a time-seeded
    /// name, suppressing engine verbosity. Returns the container name.
    pub fn create_from_scratch(&self) -> Result<String> {
        let name = format!(
            "{}-{}",
            CONTAINER_NAME_PREFIX,
            chrono::Utc::now().timestamp()
        );
        tracing::debug!(container = %name, "Creating container from scratch");

        let out = self.execute(&args(&["from", "--name", &name, "--log-level=error", "scratch"]))?;
        let container = out.trim().to_string();
        tracing::debug!(container = %container, "Created container");
        Ok(container)
    }

    /// Create a working container from a locally present image. Fails if
    /// the image would have to be pulled. Returns the container name.
    pub fn create_from_image(&self, image: &str) -> Result<String> {
        self.sweep_stale_containers();

        let out = self
            .execute(&args(&["from", "--pull=never", image]))
            .map_err(|e| {
                ForgeError::Other(format!(
                    "failed to create container from image '{image}': {e}"
                ))
            })?;
        let container = out.trim().to_string();
        tracing::debug!(container = %container, image, "Created container from image");
        Ok(container)
    }

    /// Mount a working container and return its rootfs path on the host.
    /// If the mount fails or the reported path does not exist, the
    /// container is removed before the error is returned.
    pub fn mount(&self, container: &str) -> Result<PathBuf> {
        tracing::debug!(container, "Mounting container");

        let out = match self.execute(&args(&["mount", container])) {
            Ok(out) => out,
            Err(e) => {
                self.execute_best_effort(&args(&["rm", container]));
                return Err(ForgeError::Other(format!(
                    "failed to mount container '{container}': {e}"
                )));
            }
        };

        let mount_point = out.trim();
        if mount_point.is_empty() || !Path::new(mount_point).exists() {
            self.execute_best_effort(&args(&["rm", container]));
            return Err(ForgeError::Lookup(format!(
                "mount point '{mount_point}' reported for container '{container}' does not exist"
            )));
        }

        tracing::debug!(container, mount_point, "Container mounted");
        Ok(PathBuf::from(mount_point))
    }

    /// Unmount a working container.
    pub fn unmount(&self, container: &str) -> Result<()> {
        tracing::debug!(container, "Unmounting container");
        self.execute(&args(&["umount", container]))?;
        Ok(())
    }

    /// Remove a working container.
    pub fn remove(&self, container: &str) -> Result<()> {
        self.execute(&args(&["rm", container])).map_err(|e| {
            ForgeError::Other(format!("failed to remove container '{container}': {e}"))
        })?;
        Ok(())
    }

    /// Unmount (best effort) and remove (required) a working container.
    pub fn cleanup(&self, container: &str) -> Result<()> {
        tracing::debug!(container, "Cleaning up container");
        if let Err(e) = self.unmount(container) {
            tracing::warn!(
                container,
                error = %e,
                "Failed to unmount container during cleanup (might already be unmounted)"
            );
        }
        self.remove(container)?;
        tracing::debug!(container, "Container cleaned up");
        Ok(())
    }

    /// Execute a shell command inside the container.
    pub fn run(&self, container: &str, command: &str) -> Result<()> {
        tracing::debug!(container, command, "Running command in container");
        self.execute(&args(&["run", container, "--", "sh", "-c", command]))?;
        Ok(())
    }

    /// Execute a shell command inside the container and return its stdout.
    pub fn run_with_output(&self, container: &str, command: &str) -> Result<String> {
        tracing::debug!(container, command, "Running command in container (capturing output)");
        self.execute(&args(&["run", container, "--", "sh", "-c", command]))
    }

    /// Execute a shell command inside the container, feeding each output
    /// line to `on_line` as it arrives. Returns the full transcript.
    pub fn run_streaming(
        &self,
        container: &str,
        command: &str,
        on_line: impl FnMut(&str),
    ) -> Result<String> {
        tracing::debug!(container, command, "Running command in container (streamed)");
        let (program, argv) =
            self.invocation(&args(&["run", container, "--", "sh", "-c", command]));
        exec::run_streaming(&program, &argv, on_line)
    }

    /// Existence probe for a path inside the container. Success means the
    /// path exists.
    pub fn stat(&self, container: &str, path: &str) -> Result<()> {
        tracing::debug!(container, path, "Checking for path in container");
        self.execute(&args(&["run", container, "--", "stat", path]))?;
        Ok(())
    }

    /// Copy a single file out of the container by running `cat` inside it
    /// and writing its stdout to a host file (created with default mode).
    /// More reliable than the engine's own copy for single files in
    /// rootless setups.
    pub fn copy_out_file(&self, container: &str, src: &str, dst: &Path) -> Result<()> {
        tracing::debug!(container, src, dst = %dst.display(), "Copying file out of container");

        let (program, argv) = self.invocation(&args(&["run", container, "--", "cat", src]));
        let command_line = exec::render_command_line(&program, &argv);
        tracing::debug!(command = %command_line, "Executing");

        let output = Command::new(&program)
            .args(&argv)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ForgeError::Command {
                command: command_line.clone(),
                code: None,
                output: format!("failed to spawn: {}", e),
            })?;

        if !output.status.success() {
            return Err(ForgeError::Command {
                command: command_line,
                code: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        std::fs::write(dst, &output.stdout).map_err(|e| {
            ForgeError::Other(format!(
                "failed to write '{}' on host: {}",
                dst.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Export a locally stored image to a Docker v2.2 archive tarball.
    pub fn save_image_to_archive(&self, image: &str, dst: &Path) -> Result<()> {
        tracing::debug!(image, dst = %dst.display(), "Saving image to archive");
        self.execute(&args(&[
            "push",
            image,
            &format!("docker-archive:{}", dst.display()),
        ]))
        .map_err(|e| {
            ForgeError::Other(format!("failed to save image '{image}' to archive: {e}"))
        })?;
        Ok(())
    }

    /// Push a working container's image to a registry reference with the
    /// configured push options.
    pub fn push(&self, image_ref: &str, container: &str) -> Result<()> {
        tracing::info!(image = image_ref, container, "Pushing image via engine");
        let mut push = vec!["push".to_string()];
        push.extend(self.push_opts.iter().cloned());
        push.push(container.to_string());
        push.push(image_ref.to_string());
        self.execute(&push)?;
        Ok(())
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write a stub engine script that appends its argv to `calls.log`
    /// inside `dir` and then dispatches on the first argument.
    fn stub_engine(dir: &Path, dispatch: &str) -> ContainerBackend {
        let log = dir.join("calls.log");
        let path = dir.join("engine-stub");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> {log}\ncase \"$1\" in\n{dispatch}\nesac\n",
            log = log.display(),
            dispatch = dispatch
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        ContainerBackend::with_program(
            path.to_str().unwrap(),
            false,
            Vec::new(),
            Vec::new(),
        )
    }

    fn calls(dir: &Path) -> String {
        fs::read_to_string(dir.join("calls.log")).unwrap_or_default()
    }

    #[test]
    fn test_invocation_rootful() {
        let backend =
            ContainerBackend::with_program("buildah", false, Vec::new(), Vec::new());
        let (program, argv) = backend.invocation(&args(&["mount", "worker"]));
        assert_eq!(program, "buildah");
        assert_eq!(argv, args(&["mount", "worker"]));
    }

    #[test]
    fn test_invocation_rootless_prefixes_userns_helper() {
        let backend = ContainerBackend::with_program("buildah", true, Vec::new(), Vec::new());
        let (program, argv) = backend.invocation(&args(&["mount", "worker"]));
        assert_eq!(program, "unshare");
        assert_eq!(argv, args(&["buildah", "mount", "worker"]));
    }

    #[test]
    fn test_pull_parent_scratch_is_a_no_op() {
        // Pointing at a nonexistent binary proves nothing is invoked.
        let backend =
            ContainerBackend::with_program("/nonexistent/engine", false, Vec::new(), Vec::new());
        backend.pull_parent("").unwrap();
        backend.pull_parent(SCRATCH).unwrap();
    }

    #[test]
    fn test_pull_parent_local_hit_skips_pull() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "inspect) exit 0 ;;");

        backend.pull_parent("reg:5000/base/rocky:9").unwrap();

        let log = calls(dir.path());
        assert!(log.contains("inspect --type=image reg:5000/base/rocky:9"));
        assert!(!log.contains("pull"), "no pull verb expected, got:\n{log}");
    }

    #[test]
    fn test_pull_parent_pulls_when_absent() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("pulled");
        let dispatch = format!(
            "inspect) [ -f {m} ] || exit 1 ;;\n  pull) touch {m} ;;\n  containers) : ;;",
            m = marker.display()
        );
        let backend = stub_engine(dir.path(), &dispatch);

        backend.pull_parent("reg:5000/base/rocky:9").unwrap();

        let log = calls(dir.path());
        assert!(log.contains("pull reg:5000/base/rocky:9"));
        // inspect before the pull and verification after it
        assert_eq!(log.matches("inspect --type=image").count(), 2);
    }

    #[test]
    fn test_pull_parent_passes_pull_options() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("pulled");
        let dispatch = format!(
            "inspect) [ -f {m} ] || exit 1 ;;\n  pull) touch {m} ;;\n  containers) : ;;",
            m = marker.display()
        );
        let log_path = dir.path().join("calls.log");
        let path = dir.path().join("engine-stub");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> {}\ncase \"$1\" in\n{}\nesac\n",
            log_path.display(),
            dispatch
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        let backend = ContainerBackend::with_program(
            path.to_str().unwrap(),
            false,
            vec!["--tls-verify=false".to_string()],
            Vec::new(),
        );

        backend.pull_parent("reg:5000/base/rocky:9").unwrap();
        let log = calls(dir.path());
        assert!(log.contains("pull --tls-verify=false reg:5000/base/rocky:9"));
    }

    #[test]
    fn test_create_from_image_sweeps_stale_containers() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(
            dir.path(),
            "containers) echo stale-1 ;;\n  from) echo fresh-worker ;;",
        );

        let container = backend.create_from_image("reg:5000/base/rocky:9").unwrap();
        assert_eq!(container, "fresh-worker");

        let log = calls(dir.path());
        assert!(log.contains("rm stale-1"));
        assert!(log.contains("from --pull=never reg:5000/base/rocky:9"));
    }

    #[test]
    fn test_create_from_scratch_trims_name() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "from) echo 'working-container  ' ;;");
        let container = backend.create_from_scratch().unwrap();
        assert_eq!(container, "working-container");

        let log = calls(dir.path());
        assert!(log.contains("from --name pxeforge-"));
        assert!(log.contains("--log-level=error scratch"));
    }

    #[test]
    fn test_mount_returns_existing_path() {
        let dir = TempDir::new().unwrap();
        let mount_dir = dir.path().join("merged");
        fs::create_dir(&mount_dir).unwrap();
        let backend = stub_engine(
            dir.path(),
            &format!("mount) echo {} ;;", mount_dir.display()),
        );

        let mounted = backend.mount("worker").unwrap();
        assert_eq!(mounted, mount_dir);
    }

    #[test]
    fn test_mount_failure_removes_container() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "mount) exit 1 ;;");

        assert!(backend.mount("worker").is_err());
        assert!(calls(dir.path()).contains("rm worker"));
    }

    #[test]
    fn test_mount_rejects_missing_mount_point() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "mount) echo /definitely/not/here ;;");

        let err = backend.mount("worker").unwrap_err();
        assert!(matches!(err, ForgeError::Lookup(_)));
        assert!(calls(dir.path()).contains("rm worker"));
    }

    #[test]
    fn test_cleanup_tolerates_umount_failure() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "umount) exit 1 ;;");
        backend.cleanup("worker").unwrap();
        assert!(calls(dir.path()).contains("rm worker"));
    }

    #[test]
    fn test_cleanup_fails_when_remove_fails() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "rm) exit 1 ;;");
        assert!(backend.cleanup("worker").is_err());
    }

    #[test]
    fn test_run_command_shape() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "run) : ;;");
        backend.run("worker", "ls /lib/modules").unwrap();
        assert!(calls(dir.path()).contains("run worker -- sh -c ls /lib/modules"));
    }

    #[test]
    fn test_stat_reports_absence_as_error() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "run) exit 1 ;;");
        assert!(backend.stat("worker", "/boot/vmlinuz").is_err());
    }

    #[test]
    fn test_copy_out_file_writes_stdout_to_host() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "run) printf 'kernel-bytes' ;;");
        let dst = dir.path().join("kernel");

        backend
            .copy_out_file("worker", "/boot/vmlinuz", &dst)
            .unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "kernel-bytes");
    }

    #[test]
    fn test_copy_out_file_captures_stderr_on_failure() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "run) echo 'no such file' >&2; exit 1 ;;");
        let dst = dir.path().join("kernel");

        let err = backend
            .copy_out_file("worker", "/boot/vmlinuz", &dst)
            .unwrap_err();
        assert!(err.to_string().contains("no such file"));
        assert!(!dst.exists());
    }

    #[test]
    fn test_save_image_to_archive_argv() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "push) : ;;");
        let archive = dir.path().join("parent.tar");

        backend
            .save_image_to_archive("reg:5000/base/rocky:9", &archive)
            .unwrap();
        assert!(calls(dir.path()).contains(&format!(
            "push reg:5000/base/rocky:9 docker-archive:{}",
            archive.display()
        )));
    }

    #[test]
    fn test_push_includes_options_and_ordering() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("calls.log");
        let path = dir.path().join("engine-stub");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> {}\nexit 0\n",
            log_path.display()
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        let backend = ContainerBackend::with_program(
            path.to_str().unwrap(),
            false,
            Vec::new(),
            vec!["--tls-verify=false".to_string()],
        );

        backend.push("reg:5000/base/rocky:9", "worker").unwrap();
        assert!(calls(dir.path())
            .contains("push --tls-verify=false worker reg:5000/base/rocky:9"));
    }

    #[test]
    fn test_run_streaming_surfaces_lines() {
        let dir = TempDir::new().unwrap();
        let backend = stub_engine(dir.path(), "run) echo 'Installing: wget' ;;");
        let mut seen = Vec::new();
        backend
            .run_streaming("worker", "dnf install wget", |line| {
                seen.push(line.to_string())
            })
            .unwrap();
        assert!(seen.iter().any(|l| l.contains("Installing: wget")));
    }
}
