//! In-memory OCI image assembly.
//!
//! An [`ImageAssembler`] starts from an empty image or a parent seeded
//! out of a docker archive, appends semantically named layers, and pushes
//! the result to a registry under one or more tags. Layers are recognized
//! across image generations by their history comment strings, so those
//! exact strings (and the history author) are part of the wire contract
//! with previously published images.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use flate2::Compression;
use oci_distribution::Reference;

use pxeforge_core::error::{ForgeError, Result};
use pxeforge_core::recipe::{write_recipe, BuildRecipe};

use super::archive::SeedImage;
use super::config::{HistoryEntry, ImageConfigFile};
use super::layer::{write_dir_layer, LayerBlob};
use super::reference::{build_image_reference, sanitize_registry_url};
use super::registry::{
    DistributionTransport, PushableImage, PushableLayer, RegistryTransport,
};

/// History author stamped on every layer; kept stable so images
/// interoperate with previously published parents.
const LAYER_CREATED_BY: &str = "go-image-builder";

pub const BASE_LAYER_COMMENT: &str = "Base OS Layer";
pub const CONFIG_LAYER_COMMENT: &str = "Configuration Layer";
pub const KERNEL_LAYER_COMMENT: &str = "Kernel Layer";
pub const INITRD_LAYER_COMMENT: &str = "Initrd Layer";

const LABEL_PARENT: &str = "com.openchami.image.parent";
const LABEL_BUILD_HOST: &str = "com.openchami.image.build.host";
const LABEL_BUILD_USER: &str = "com.openchami.image.build.user";
const LABEL_KERNEL_VERSION: &str = "com.openchami.image.kernel-version";
const LABEL_OS_PREFIX: &str = "com.openchami.image.os.";

const MAX_PUSH_ATTEMPTS: u32 = 3;

/// Composes the final OCI image and pushes it.
pub struct ImageAssembler {
    recipe: BuildRecipe,
    full_name: String,
    config: ImageConfigFile,
    layers: Vec<LayerBlob>,
    /// History/layer counts of the seeded parent; appended layers live
    /// beyond these indices.
    seed_history_len: usize,
    seed_layer_len: usize,
    /// Snapshot of the parent's labels, for carrying kernel/initrd labels
    /// through layer reuse.
    seed_labels: HashMap<String, String>,
    temp_dirs: Vec<PathBuf>,
    parent_archive: Option<PathBuf>,
    transport: Box<dyn RegistryTransport>,
}

impl ImageAssembler {
    /// Create an assembler for `registry/name`. With a seed the parent's
    /// config and layers become the starting point; without one the image
    /// starts empty, stamped amd64/linux/now.
    pub fn new(
        registry: &str,
        name: &str,
        recipe: BuildRecipe,
        seed: Option<SeedImage>,
        parent_archive: Option<PathBuf>,
    ) -> Self {
        let transport: Box<dyn RegistryTransport> = Box::new(DistributionTransport::new(
            &recipe.options.registry_opts_push,
        ));
        Self::with_transport(registry, name, recipe, seed, parent_archive, transport)
    }

    pub(crate) fn with_transport(
        registry: &str,
        name: &str,
        recipe: BuildRecipe,
        seed: Option<SeedImage>,
        parent_archive: Option<PathBuf>,
        transport: Box<dyn RegistryTransport>,
    ) -> Self {
        let full_name = build_image_reference(registry, name);
        tracing::debug!(image = %full_name, "Creating image assembler");

        let mut temp_dirs = Vec::new();
        let (config, layers, seed_history_len, seed_layer_len, seed_labels) = match seed {
            Some(seed) => {
                tracing::debug!("Using provided parent image as base");
                temp_dirs.push(seed.extracted_dir);
                let labels = seed
                    .config
                    .config
                    .labels
                    .clone()
                    .unwrap_or_default();
                let history_len = seed.config.history.len();
                let layer_len = seed.layers.len();
                (seed.config, seed.layers, history_len, layer_len, labels)
            }
            None => {
                tracing::debug!("No parent image provided, creating new empty image");
                let config = ImageConfigFile {
                    architecture: "amd64".to_string(),
                    os: "linux".to_string(),
                    created: Some(chrono::Utc::now()),
                    ..Default::default()
                };
                (config, Vec::new(), 0, 0, HashMap::new())
            }
        };

        Self {
            recipe,
            full_name,
            config,
            layers,
            seed_history_len,
            seed_layer_len,
            seed_labels,
            temp_dirs,
            parent_archive,
            transport,
        }
    }

    /// Add the rootfs as the base layer, stamping OS and build labels.
    pub fn add_base_layer(&mut self, rootfs: &Path) -> Result<()> {
        tracing::debug!(rootfs = %rootfs.display(), "Adding base layer");

        let temp_dir = make_temp_dir("base-layer-")?;
        let built = write_dir_layer(
            rootfs,
            &temp_dir.join("layer.tar.gz"),
            Compression::best(),
        )
        .and_then(|blob| {
            self.apply_base_labels(rootfs)?;
            Ok(blob)
        });

        self.finish_layer(temp_dir, built, BASE_LAYER_COMMENT)
    }

    /// Embed the recipe as `etc/image-config.yaml` in its own layer.
    pub fn add_config_layer(&mut self) -> Result<()> {
        tracing::debug!("Adding config layer");

        let temp_dir = make_temp_dir("config-layer-")?;
        let built = (|| {
            let etc_dir = temp_dir.join("layer/etc");
            make_dir_0755(&etc_dir)?;
            let layer_dir = temp_dir.join("layer");
            let config_path = etc_dir.join("image-config.yaml");
            write_recipe(&self.recipe, &config_path)?;
            fs::set_permissions(&config_path, fs::Permissions::from_mode(0o644))
                .map_err(ForgeError::Io)?;
            write_dir_layer(&layer_dir, &temp_dir.join("layer.tar.gz"), Compression::default())
        })();

        self.finish_layer(temp_dir, built, CONFIG_LAYER_COMMENT)
    }

    /// Add the kernel as `boot/vmlinuz`, or reuse the parent's kernel
    /// layer when its history carries one.
    pub fn add_kernel_layer(&mut self, kernel_path: &Path, kernel_version: &str) -> Result<()> {
        if self.copy_layer_from_seed(KERNEL_LAYER_COMMENT)? {
            return Ok(());
        }

        tracing::debug!(kernel = %kernel_path.display(), "Adding kernel layer");
        let temp_dir = make_temp_dir("kernel-layer-")?;
        let built = (|| {
            let layer_dir = temp_dir.join("layer");
            stage_boot_file(&layer_dir, "vmlinuz", kernel_path)?;
            write_dir_layer(&layer_dir, &temp_dir.join("layer.tar.gz"), Compression::default())
        })()
        .map(|blob| {
            self.config
                .config
                .labels_mut()
                .insert(LABEL_KERNEL_VERSION.to_string(), kernel_version.to_string());
            blob
        });

        self.finish_layer(temp_dir, built, KERNEL_LAYER_COMMENT)
    }

    /// Add the initrd as `boot/initrd.img`, or reuse the parent's initrd
    /// layer. When reuse succeeds the path is not needed and may be
    /// `None`.
    pub fn add_initrd_layer(&mut self, initrd_path: Option<&Path>) -> Result<()> {
        if self.copy_layer_from_seed(INITRD_LAYER_COMMENT)? {
            return Ok(());
        }

        let initrd_path = initrd_path.ok_or_else(|| {
            ForgeError::ImageAssembly(
                "no initrd path provided and the parent has no initrd layer".to_string(),
            )
        })?;

        tracing::debug!(initrd = %initrd_path.display(), "Adding initrd layer");
        let temp_dir = make_temp_dir("initrd-layer-")?;
        let built = (|| {
            let layer_dir = temp_dir.join("layer");
            stage_boot_file(&layer_dir, "initrd.img", initrd_path)?;
            write_dir_layer(&layer_dir, &temp_dir.join("layer.tar.gz"), Compression::default())
        })();

        self.finish_layer(temp_dir, built, INITRD_LAYER_COMMENT)
    }

    /// Whether the seeded parent's history carries a layer with this
    /// comment. Layers appended during this build are not considered.
    pub fn has_layer_with_comment(&self, comment: &str) -> bool {
        self.recipe.has_parent()
            && self.config.history[..self.seed_history_len]
                .iter()
                .any(|h| h.has_comment(comment))
    }

    /// Extract a file from the assembled layers, last-write-wins across
    /// layers, and write it to `dst`.
    pub fn extract_file(&self, path_in_image: &str, dst: &Path) -> Result<()> {
        let wanted = PathBuf::from(path_in_image);

        for blob in self.layers.iter().rev() {
            let reader = super::layer::open_uncompressed(&blob.path)?;
            let mut archive = tar::Archive::new(reader);
            for entry in archive.entries().map_err(|e| {
                ForgeError::ImageAssembly(format!(
                    "error reading layer tar {}: {}",
                    blob.path.display(),
                    e
                ))
            })? {
                let mut entry = entry.map_err(|e| {
                    ForgeError::ImageAssembly(format!("error reading layer entry: {e}"))
                })?;
                let name = entry.path().map_err(|e| {
                    ForgeError::ImageAssembly(format!("bad path in layer entry: {e}"))
                })?;
                if normalize_entry_path(&name) != wanted {
                    continue;
                }

                if let Some(parent) = dst.parent() {
                    make_dir_0755(parent)?;
                }
                let mut out = fs::File::create(dst).map_err(|e| {
                    ForgeError::Other(format!(
                        "failed to create destination file '{}': {}",
                        dst.display(),
                        e
                    ))
                })?;
                std::io::copy(&mut entry, &mut out).map_err(ForgeError::Io)?;
                tracing::debug!(path = path_in_image, dst = %dst.display(), "Extracted file");
                return Ok(());
            }
        }

        Err(ForgeError::Lookup(format!(
            "file '{path_in_image}' not found in any layer of the image"
        )))
    }

    /// Extract the kernel (`/boot/vmlinuz`) from the assembled layers.
    pub fn extract_kernel(&self, dst: &Path) -> Result<()> {
        self.extract_file("/boot/vmlinuz", dst)
    }

    /// Extract the initrd (`/boot/initrd.img`) from the assembled layers.
    pub fn extract_initrd(&self, dst: &Path) -> Result<()> {
        self.extract_file("/boot/initrd.img", dst)
    }

    /// Push the image under every publish tag, retrying transient blob
    /// upload failures.
    pub async fn push(&self) -> Result<()> {
        tracing::debug!(image = %self.full_name, "Starting image push");
        let base_ref: Reference = self.full_name.parse().map_err(|e| {
            ForgeError::Registry(format!(
                "failed to parse image reference '{}': {e}",
                self.full_name
            ))
        })?;

        let image = self.pushable()?;

        // Best effort: the parent may exist but be unlisted by this probe.
        if let Err(e) = self.ensure_parent_image(&image).await {
            tracing::warn!(
                error = %e,
                "Could not ensure parent image exists (this may be safe to ignore)"
            );
        }

        let fallback = base_ref.tag().unwrap_or("latest");
        let tags = split_publish_tags(&self.recipe.options.publish_tags, fallback);
        tracing::debug!(?tags, "Publishing with tags");

        for tag in &tags {
            self.push_tag_with_retries(&base_ref, tag, &image).await?;
        }

        tracing::info!(image = %self.full_name, "Successfully pushed all tags");
        Ok(())
    }

    /// Remove all staging directories and the parent archive.
    pub fn cleanup(&mut self) {
        tracing::debug!("Cleaning up temporary build artifacts");
        for dir in self.temp_dirs.drain(..) {
            tracing::debug!(dir = %dir.display(), "Removing temporary directory");
            let _ = fs::remove_dir_all(&dir);
        }
        if let Some(archive) = self.parent_archive.take() {
            tracing::debug!(archive = %archive.display(), "Removing parent archive");
            let _ = fs::remove_file(&archive);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Common tail of every add operation: on success stamp the config,
    /// append the layer and keep the staging directory until cleanup; on
    /// failure remove the staging directory and propagate.
    fn finish_layer(
        &mut self,
        temp_dir: PathBuf,
        built: Result<LayerBlob>,
        comment: &str,
    ) -> Result<()> {
        match built {
            Ok(blob) => {
                self.append_layer(blob, comment);
                self.temp_dirs.push(temp_dir);
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&temp_dir);
                Err(e)
            }
        }
    }

    fn append_layer(&mut self, blob: LayerBlob, comment: &str) {
        let now = chrono::Utc::now();
        self.config.config.labels_mut();
        self.config.created = Some(now);
        self.config.history.push(HistoryEntry {
            created: Some(now),
            created_by: Some(LAYER_CREATED_BY.to_string()),
            comment: Some(comment.to_string()),
            empty_layer: None,
        });
        self.config.rootfs.diff_ids.push(blob.diff_id.clone());
        self.layers.push(blob);
        tracing::debug!(comment, "Layer appended");
    }

    /// Parse `rootfs/etc/os-release` into OS labels and stamp parent and
    /// build-host information. A missing os-release keeps whatever labels
    /// the parent carried.
    fn apply_base_labels(&mut self, rootfs: &Path) -> Result<()> {
        let os_release = rootfs.join("etc/os-release");
        match fs::read_to_string(&os_release) {
            Ok(data) => {
                tracing::debug!("Found /etc/os-release in new layer, parsing for OS info");
                let info = parse_os_release(&data);
                let labels = self.config.config.labels_mut();
                for (label_key, os_key) in [
                    ("name", "NAME"),
                    ("version", "VERSION"),
                    ("id", "ID"),
                    ("id_like", "ID_LIKE"),
                ] {
                    labels.insert(
                        format!("{LABEL_OS_PREFIX}{label_key}"),
                        info.get(os_key).cloned().unwrap_or_default(),
                    );
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "'/etc/os-release' not found in new layer; OS labels will be inherited from parent if available"
                );
            }
            Err(e) => {
                return Err(ForgeError::Other(format!(
                    "failed to read {}: {}",
                    os_release.display(),
                    e
                )));
            }
        }

        if self.recipe.has_parent() {
            self.config.config.labels_mut().insert(
                LABEL_PARENT.to_string(),
                self.recipe.options.parent.clone(),
            );
            tracing::debug!(layers = self.seed_layer_len, "Parent image layer count");
        }

        let hostname = nix::unistd::gethostname()
            .map_err(|e| ForgeError::Other(format!("failed to get hostname: {e}")))?;
        let labels = self.config.config.labels_mut();
        labels.insert(
            LABEL_BUILD_HOST.to_string(),
            hostname.to_string_lossy().into_owned(),
        );
        labels.insert(
            LABEL_BUILD_USER.to_string(),
            std::env::var("USER").unwrap_or_default(),
        );
        Ok(())
    }

    /// Search the seeded parent's history for `comment`; when found,
    /// append the parent's corresponding layer (and its history entry)
    /// to the new image and carry matching labels over. Returns whether
    /// a layer was copied.
    fn copy_layer_from_seed(&mut self, comment: &str) -> Result<bool> {
        if !self.recipe.has_parent() {
            return Ok(false);
        }

        let index = self.config.history[..self.seed_history_len]
            .iter()
            .position(|h| h.has_comment(comment));
        let index = match index {
            Some(index) => index,
            None => {
                tracing::debug!(
                    comment,
                    "Did not find history comment in parent image, will create new layer"
                );
                return Ok(false);
            }
        };

        if index >= self.seed_layer_len {
            return Err(ForgeError::Lookup(format!(
                "history index {index} is out of bounds for parent layers (count: {})",
                self.seed_layer_len
            )));
        }

        tracing::info!(comment, "Found existing layer in parent image, appending it");

        let blob = self.layers[index].clone();
        let history = self.config.history[index].clone();

        let labels = self.config.config.labels_mut();
        for (key, value) in &self.seed_labels {
            if key.contains("kernel") && comment.contains("Kernel") {
                labels.insert(key.clone(), value.clone());
            }
            if key.contains("initrd") && comment.contains("Initrd") {
                labels.insert(key.clone(), value.clone());
            }
        }

        self.config.rootfs.diff_ids.push(blob.diff_id.clone());
        self.config.history.push(history);
        self.layers.push(blob);
        Ok(true)
    }

    /// Probe the registry for the parent's manifest and, when absent,
    /// push the current image under the parent's reference. That
    /// overwrites the parent with a descendant, so it is loudly flagged.
    async fn ensure_parent_image(&self, image: &PushableImage) -> Result<()> {
        if !self.recipe.has_parent() {
            return Ok(());
        }

        let parent_str = sanitize_registry_url(&self.recipe.options.parent);
        let parent_ref: Reference = parent_str.parse().map_err(|e| {
            ForgeError::Registry(format!(
                "failed to parse parent image reference '{parent_str}': {e}"
            ))
        })?;

        if self.transport.manifest_exists(&parent_ref).await {
            tracing::debug!(parent = %parent_ref, "Parent image manifest found in registry");
            return Ok(());
        }

        tracing::warn!(
            parent = %parent_ref,
            "Parent manifest not found in registry; pushing the current image under the parent reference (this replaces the parent with a descendant)"
        );
        self.transport.push(&parent_ref, image).await?;
        tracing::debug!(parent = %parent_ref, "Pushed image under parent reference");
        Ok(())
    }

    async fn push_tag_with_retries(
        &self,
        base_ref: &Reference,
        tag: &str,
        image: &PushableImage,
    ) -> Result<()> {
        let tagged = Reference::with_tag(
            base_ref.registry().to_string(),
            base_ref.repository().to_string(),
            tag.to_string(),
        );

        let mut last_err: Option<ForgeError> = None;
        for attempt in 0..MAX_PUSH_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_secs(u64::from(2 * attempt));
                tracing::debug!(
                    tag,
                    ?backoff,
                    attempt = attempt + 1,
                    max = MAX_PUSH_ATTEMPTS,
                    "Retrying push"
                );
                tokio::time::sleep(backoff).await;
            }

            tracing::info!(reference = %tagged, "Pushing image tag");
            match self.transport.push(&tagged, image).await {
                Ok(()) => {
                    tracing::info!(reference = %tagged, "Successfully pushed tag");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(tag, attempt = attempt + 1, error = %e, "Push attempt failed");
                    let retryable = e.is_retryable_registry_error();
                    last_err = Some(e);
                    if !retryable {
                        tracing::error!(tag, "Unrecoverable error while pushing tag, stopping retries");
                        break;
                    }
                }
            }
        }

        Err(ForgeError::Registry(format!(
            "failed to push tag {tag} after {MAX_PUSH_ATTEMPTS} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Serialize the config and read every layer blob into memory for
    /// pushing.
    fn pushable(&self) -> Result<PushableImage> {
        let config_data = serde_json::to_vec(&self.config)?;
        let layers = self
            .layers
            .iter()
            .map(|blob| {
                fs::read(&blob.path)
                    .map(|data| PushableLayer {
                        data,
                        media_type: blob.media_type.clone(),
                    })
                    .map_err(|e| {
                        ForgeError::ImageAssembly(format!(
                            "failed to read layer blob {}: {}",
                            blob.path.display(),
                            e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PushableImage { config_data, layers })
    }
}

/// Split a comma-separated publish tag list, trimming entries and
/// discarding empties; an empty list falls back to the base reference's
/// identifier.
fn split_publish_tags(publish_tags: &str, fallback: &str) -> Vec<String> {
    let tags: Vec<String> = publish_tags
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if tags.is_empty() {
        vec![fallback.to_string()]
    } else {
        tags
    }
}

/// Normalize a tar entry name to an absolute path, resolving `.` and
/// `..` components the way a layered filesystem would.
fn normalize_entry_path(name: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in name.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

/// Parse `KEY="value"` lines.
fn parse_os_release(data: &str) -> HashMap<String, String> {
    let mut info = HashMap::new();
    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            info.insert(key.to_string(), value.trim_matches('"').to_string());
        }
    }
    info
}

/// Stage a single file as `boot/<name>` (mode 0644) under a layer dir.
fn stage_boot_file(layer_dir: &Path, name: &str, src: &Path) -> Result<()> {
    let boot_dir = layer_dir.join("boot");
    make_dir_0755(&boot_dir)?;
    let dst = boot_dir.join(name);
    let data = fs::read(src).map_err(|e| {
        ForgeError::Other(format!("failed to read {}: {}", src.display(), e))
    })?;
    fs::write(&dst, data).map_err(|e| {
        ForgeError::Other(format!("failed to write {}: {}", dst.display(), e))
    })?;
    fs::set_permissions(&dst, fs::Permissions::from_mode(0o644)).map_err(ForgeError::Io)?;
    Ok(())
}

fn make_dir_0755(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        ForgeError::Other(format!("failed to create directory {}: {}", dir.display(), e))
    })?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).map_err(ForgeError::Io)?;
    Ok(())
}

fn make_temp_dir(prefix: &str) -> Result<PathBuf> {
    Ok(tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .map_err(|e| {
            ForgeError::ImageAssembly(format!("failed to create temporary directory: {e}"))
        })?
        .into_path())
}
