//! Serde model of the OCI image config file.
//!
//! The shape matches the config blob the build engine writes into
//! docker-archive exports, so a parent image's config deserializes
//! straight into these types and re-serializes without losing fields the
//! composer does not touch (`Env`, `Cmd`, ... ride in a flattened map).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Full image config file: platform, runtime config, rootfs diff-ids and
/// layer history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl ImageConfigFile {
    /// Look up a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.label(key)
    }
}

/// The `config` block. Only labels are composed here; everything else an
/// imported parent carries is preserved verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RuntimeConfig {
    /// The labels map, created on first use.
    pub fn labels_mut(&mut self) -> &mut HashMap<String, String> {
        self.labels.get_or_insert_with(HashMap::new)
    }

    /// Look up a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.as_ref()?.get(key).map(String::as_str)
    }
}

/// The `rootfs` block: ordered diff-ids of the uncompressed layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One history entry. For images this tool builds, history index i names
/// layer index i through its comment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

impl HistoryEntry {
    pub fn has_comment(&self, comment: &str) -> bool {
        self.comment.as_deref() == Some(comment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rootfs_type() {
        let rootfs = RootFs::default();
        assert_eq!(rootfs.fs_type, "layers");
        assert!(rootfs.diff_ids.is_empty());
    }

    #[test]
    fn test_labels_mut_creates_map() {
        let mut config = RuntimeConfig::default();
        assert!(config.labels.is_none());
        config
            .labels_mut()
            .insert("com.openchami.image.os.id".to_string(), "rocky".to_string());
        assert_eq!(config.label("com.openchami.image.os.id"), Some("rocky"));
    }

    #[test]
    fn test_config_roundtrip_preserves_unknown_fields() {
        let raw = r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Cmd": ["/sbin/init"],
                "Labels": {"com.openchami.image.os.id": "rocky"}
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": ["sha256:aaa", "sha256:bbb"]
            },
            "history": [
                {"created": "2025-06-01T12:00:00Z", "created_by": "go-image-builder", "comment": "Base OS Layer"},
                {"created": "2025-06-01T12:00:01Z", "created_by": "go-image-builder", "comment": "Configuration Layer"}
            ]
        }"#;

        let parsed: ImageConfigFile = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.architecture, "amd64");
        assert_eq!(parsed.rootfs.diff_ids.len(), 2);
        assert_eq!(parsed.history.len(), 2);
        assert!(parsed.history[0].has_comment("Base OS Layer"));
        assert_eq!(parsed.config.label("com.openchami.image.os.id"), Some("rocky"));

        let reserialized = serde_json::to_string(&parsed).unwrap();
        assert!(reserialized.contains("\"Env\""));
        assert!(reserialized.contains("/sbin/init"));
        assert!(reserialized.contains("\"created_by\":\"go-image-builder\""));
    }

    #[test]
    fn test_history_comment_matching() {
        let entry = HistoryEntry {
            comment: Some("Kernel Layer".to_string()),
            ..Default::default()
        };
        assert!(entry.has_comment("Kernel Layer"));
        assert!(!entry.has_comment("Initrd Layer"));
        assert!(!HistoryEntry::default().has_comment("Kernel Layer"));
    }
}
