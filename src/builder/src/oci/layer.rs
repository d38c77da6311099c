//! Layer blobs: tar.gz creation, digests and diff-ids.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use pxeforge_core::error::{ForgeError, Result};

pub const MEDIA_TYPE_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// One layer blob on disk, plus everything the config and manifest need
/// to know about it.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    /// Path to the blob file (tar or tar.gz)
    pub path: PathBuf,
    /// `sha256:`-prefixed digest of the blob as stored
    pub digest: String,
    /// `sha256:`-prefixed digest of the uncompressed tar stream
    pub diff_id: String,
    /// Blob size in bytes
    pub size: u64,
    /// Layer media type, matching the blob's compression
    pub media_type: String,
}

/// Archive a directory tree into a gzip-compressed tar layer.
///
/// Entry paths are stored relative to `src_dir` (with a `./` prefix, the
/// way layered-filesystem tooling expects them); symlinks are preserved,
/// not followed.
pub fn write_dir_layer(
    src_dir: &Path,
    output_path: &Path,
    compression: Compression,
) -> Result<LayerBlob> {
    let file = File::create(output_path).map_err(|e| {
        ForgeError::ImageAssembly(format!(
            "failed to create layer file {}: {}",
            output_path.display(),
            e
        ))
    })?;

    let encoder = GzEncoder::new(file, compression);
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src_dir).map_err(|e| {
        ForgeError::ImageAssembly(format!(
            "failed to archive {}: {}",
            src_dir.display(),
            e
        ))
    })?;

    let encoder = builder
        .into_inner()
        .map_err(|e| ForgeError::ImageAssembly(format!("failed to finalize layer: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ForgeError::ImageAssembly(format!("failed to compress layer: {e}")))?;

    describe_blob(output_path)
}

/// Inspect a blob file on disk and compute its digests and media type.
/// Works for both gzip-compressed and plain tar blobs (a parent archive
/// carries the latter).
pub fn describe_blob(path: &Path) -> Result<LayerBlob> {
    let digest = sha256_file(path)?;
    let size = std::fs::metadata(path)
        .map_err(|e| {
            ForgeError::ImageAssembly(format!("failed to stat blob {}: {}", path.display(), e))
        })?
        .len();

    let gzipped = is_gzipped(path)?;
    let diff_id = if gzipped {
        let mut hasher = Sha256::new();
        let mut reader = open_uncompressed(path)?;
        std::io::copy(&mut reader, &mut hasher).map_err(|e| {
            ForgeError::ImageAssembly(format!(
                "failed to decompress blob {} for diff-id: {}",
                path.display(),
                e
            ))
        })?;
        format!("sha256:{}", hex::encode(hasher.finalize()))
    } else {
        digest.clone()
    };

    Ok(LayerBlob {
        path: path.to_path_buf(),
        digest,
        diff_id,
        size,
        media_type: if gzipped { MEDIA_TYPE_TAR_GZIP } else { MEDIA_TYPE_TAR }.to_string(),
    })
}

/// Open a blob as an uncompressed tar stream, gunzipping transparently.
pub fn open_uncompressed(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| {
        ForgeError::ImageAssembly(format!("failed to open blob {}: {}", path.display(), e))
    })?;
    if is_gzipped(path)? {
        Ok(Box::new(flate2::read::GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Sniff the gzip magic bytes.
pub fn is_gzipped(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| {
        ForgeError::ImageAssembly(format!("failed to open blob {}: {}", path.display(), e))
    })?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(ForgeError::Io(e)),
    }
}

/// `sha256:`-prefixed digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        ForgeError::ImageAssembly(format!(
            "failed to read blob for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(ForgeError::Io)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// `sha256:`-prefixed digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
