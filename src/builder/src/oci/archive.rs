//! Docker v2.2 archive loading.
//!
//! `buildah push <ref> docker-archive:<path>` exports a local image as a
//! tarball containing `manifest.json`, the config blob and one tar per
//! layer. A parent image saved this way seeds the composer: its config
//! (labels, history, diff-ids) becomes the starting config of the new
//! image and its layer blobs stay addressable for reuse by history
//! comment.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use pxeforge_core::error::{ForgeError, Result};

use super::config::ImageConfigFile;
use super::layer::{describe_blob, LayerBlob};

/// A parent image loaded from a docker archive.
#[derive(Debug)]
pub struct SeedImage {
    pub config: ImageConfigFile,
    pub layers: Vec<LayerBlob>,
    /// Directory the archive was unpacked into. Owned by the composer and
    /// removed during its final cleanup.
    pub extracted_dir: PathBuf,
}

/// One entry of the archive's `manifest.json`.
#[derive(Debug, Deserialize)]
struct ArchiveManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    #[allow(dead_code)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Unpack a docker archive and load its first image.
pub fn load_docker_archive(archive_path: &Path) -> Result<SeedImage> {
    tracing::debug!(archive = %archive_path.display(), "Loading parent image archive");

    let extracted_dir = tempfile::Builder::new()
        .prefix("parent-image-")
        .tempdir()
        .map_err(|e| {
            ForgeError::ImageAssembly(format!("failed to create archive staging dir: {e}"))
        })?
        .into_path();

    let result = unpack_and_read(archive_path, &extracted_dir);
    if result.is_err() {
        let _ = std::fs::remove_dir_all(&extracted_dir);
    }
    let (config, layers) = result?;

    tracing::debug!(
        layers = layers.len(),
        history = config.history.len(),
        "Loaded parent image"
    );

    Ok(SeedImage {
        config,
        layers,
        extracted_dir,
    })
}

fn unpack_and_read(
    archive_path: &Path,
    dir: &Path,
) -> Result<(ImageConfigFile, Vec<LayerBlob>)> {
    let file = File::open(archive_path).map_err(|e| {
        ForgeError::ImageAssembly(format!(
            "failed to open archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;
    tar::Archive::new(file).unpack(dir).map_err(|e| {
        ForgeError::ImageAssembly(format!(
            "failed to unpack archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;

    let manifest_raw = std::fs::read(dir.join("manifest.json")).map_err(|e| {
        ForgeError::ImageAssembly(format!("archive has no readable manifest.json: {e}"))
    })?;
    let entries: Vec<ArchiveManifestEntry> = serde_json::from_slice(&manifest_raw)?;
    let entry = entries
        .first()
        .ok_or_else(|| ForgeError::ImageAssembly("archive manifest is empty".to_string()))?;

    let config_raw = std::fs::read(dir.join(&entry.config)).map_err(|e| {
        ForgeError::ImageAssembly(format!(
            "failed to read archive config '{}': {}",
            entry.config, e
        ))
    })?;
    let config: ImageConfigFile = serde_json::from_slice(&config_raw)?;

    let layers = entry
        .layers
        .iter()
        .map(|rel| describe_blob(&dir.join(rel)))
        .collect::<Result<Vec<_>>>()?;

    Ok((config, layers))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::io::Write;

    /// Build a docker archive holding one image with the given history
    /// comments; each named layer contains a single file
    /// `marker-<index>` so layer contents differ.
    pub fn synthetic_archive(path: &Path, comments: &[&str]) {
        let mut layer_names = Vec::new();
        let mut layer_bufs: Vec<Vec<u8>> = Vec::new();
        let mut diff_ids = Vec::new();

        for (i, _) in comments.iter().enumerate() {
            let mut buf = Vec::new();
            {
                let mut builder = tar::Builder::new(&mut buf);
                let payload = format!("layer payload {i}");
                let mut header = tar::Header::new_gnu();
                header.set_size(payload.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(&mut header, format!("marker-{i}"), payload.as_bytes())
                    .unwrap();
                builder.finish().unwrap();
            }
            diff_ids.push(super::super::layer::sha256_bytes(&buf));
            layer_names.push(format!("layer-{i}/layer.tar"));
            layer_bufs.push(buf);
        }

        let history: Vec<serde_json::Value> = comments
            .iter()
            .map(|c| {
                serde_json::json!({
                    "created": "2025-06-01T12:00:00Z",
                    "created_by": "go-image-builder",
                    "comment": c
                })
            })
            .collect();

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "created": "2025-06-01T12:00:00Z",
            "config": {
                "Labels": {
                    "com.openchami.image.os.id": "rocky",
                    "com.openchami.image.kernel-version": "5.14.0-362.el9.x86_64"
                }
            },
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
            "history": history
        });
        let config_bytes = serde_json::to_vec_pretty(&config).unwrap();

        let manifest = serde_json::json!([{
            "Config": "config.json",
            "RepoTags": ["reg:5000/base/rocky:9"],
            "Layers": layer_names
        }]);
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).unwrap();

        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        append_bytes(&mut builder, "config.json", &config_bytes);
        append_bytes(&mut builder, "manifest.json", &manifest_bytes);
        for (name, buf) in layer_names.iter().zip(&layer_bufs) {
            append_bytes(&mut builder, name, buf);
        }
        builder.into_inner().unwrap().flush().unwrap();
    }

    fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_synthetic_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("parent.tar");
        test_support::synthetic_archive(
            &archive,
            &["Base OS Layer", "Configuration Layer", "Kernel Layer", "Initrd Layer"],
        );

        let seed = load_docker_archive(&archive).unwrap();
        assert_eq!(seed.layers.len(), 4);
        assert_eq!(seed.config.history.len(), 4);
        assert!(seed.config.history[2].has_comment("Kernel Layer"));
        assert_eq!(
            seed.config.label("com.openchami.image.os.id"),
            Some("rocky")
        );
        // Uncompressed archive layers: digest == diff_id, and both match
        // the config's diff_ids.
        for (blob, diff_id) in seed.layers.iter().zip(&seed.config.rootfs.diff_ids) {
            assert_eq!(&blob.diff_id, diff_id);
        }
        assert!(seed.extracted_dir.exists());
        std::fs::remove_dir_all(&seed.extracted_dir).unwrap();
    }

    #[test]
    fn test_load_missing_archive() {
        let err = load_docker_archive(Path::new("/definitely/missing.tar")).unwrap_err();
        assert!(matches!(err, ForgeError::ImageAssembly(_)));
    }

    #[test]
    fn test_load_archive_without_manifest() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.tar");
        let file = File::create(&archive).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "nope", &b"{}"[..]).unwrap();
        builder.finish().unwrap();

        let err = load_docker_archive(&archive).unwrap_err();
        assert!(err.to_string().contains("manifest.json"));
    }
}
