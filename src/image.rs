//! In-memory record of a prepared image.
//!
//! An [`Image`] pairs the identifier it was resolved from with the root of its
//! materialized filesystem and the parsed [`ConfigSchema`]. The filesystem
//! directory is owned by the image: [`Image::cleanup`] removes it,
//! [`Image::preserve`] hands it over to the caller, and dropping the image
//! removes it as well.

use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::error::{Error, Result};

/// Identifies one filesystem layer. Position in the image's layer list is
/// authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub digest: String,
    pub size_hint: u64,
}

impl LayerInfo {
    pub fn new(digest: impl Into<String>, size_hint: u64) -> Self {
        Self {
            digest: digest.into(),
            size_hint,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    #[serde(rename = "CreatedBy")]
    pub created_by: String,
    #[serde(default, rename = "Created", skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, rename = "Comment", skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, rename = "EmptyLayer", skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

impl HistoryItem {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            ..Default::default()
        }
    }
}

/// The parts of an image config the analyzers consume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSchema {
    /// `KEY=VALUE` strings in declaration order.
    #[serde(default, rename = "Env")]
    pub env: Vec<String>,
    /// Build steps, oldest first.
    #[serde(default, rename = "History")]
    pub history: Vec<HistoryItem>,
}

impl ConfigSchema {
    /// Looks up an environment variable declared in the image config.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

pub fn from_oci_config(config: &ImageConfiguration) -> ConfigSchema {
    let env = config
        .config()
        .as_ref()
        .map(|c| c.env().clone().unwrap_or_default())
        .unwrap_or_default();

    let history = config
        .history()
        .as_ref()
        .map(|hist_vec| {
            hist_vec
                .iter()
                .map(|h| HistoryItem {
                    created_by: h.created_by().clone().unwrap_or_default(),
                    created: h.created().clone(),
                    comment: h.comment().clone(),
                    empty_layer: h.empty_layer(),
                })
                .collect()
        })
        .unwrap_or_default();

    ConfigSchema { env, history }
}

/// Parses a raw config blob belonging to `image`.
pub fn parse_config(blob: &[u8], image: &str) -> Result<ConfigSchema> {
    let config: ImageConfiguration =
        serde_json::from_slice(blob).map_err(|e| Error::ConfigParse {
            image: image.to_string(),
            reason: e.to_string(),
        })?;
    Ok(from_oci_config(&config))
}

pub struct Image {
    source: String,
    root: PathBuf,
    config: ConfigSchema,
    workdir: Option<TempDir>,
}

impl Image {
    /// Wraps a filesystem the image owns; the directory is removed on cleanup.
    pub fn new(source: impl Into<String>, workdir: TempDir, config: ConfigSchema) -> Self {
        Self {
            source: source.into(),
            root: workdir.path().to_path_buf(),
            config,
            workdir: Some(workdir),
        }
    }

    /// Wraps an existing directory the image does not own. Cleanup leaves it alone.
    pub fn from_path(source: impl Into<String>, root: impl Into<PathBuf>, config: ConfigSchema) -> Self {
        Self {
            source: source.into(),
            root: root.into(),
            config,
            workdir: None,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ConfigSchema {
        &self.config
    }

    /// Removes the materialized filesystem.
    pub fn cleanup(mut self) -> io::Result<()> {
        match self.workdir.take() {
            Some(dir) => {
                log::info!(
                    "Removing image filesystem directory {} from system",
                    self.root.display()
                );
                dir.close()
            }
            None => Ok(()),
        }
    }

    /// Keeps the materialized filesystem on disk and returns its location.
    pub fn preserve(mut self) -> PathBuf {
        match self.workdir.take() {
            Some(dir) => dir.keep(),
            None => self.root.clone(),
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("source", &self.source)
            .field("root", &self.root)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Env": ["PATH=/usr/local/bin:/usr/bin", "PYTHONPATH=/opt/lib"]
        },
        "rootfs": {"type": "layers", "diff_ids": []},
        "history": [
            {"created": "2023-01-01T00:00:00Z", "created_by": "/bin/sh -c #(nop) ADD file:abc in /"},
            {"created_by": "/bin/sh -c #(nop)  CMD [\"bash\"]", "empty_layer": true}
        ]
    }"#;

    #[test]
    fn test_parse_config_keeps_env_and_history_order() {
        let config = parse_config(CONFIG.as_bytes(), "test:latest").unwrap();
        assert_eq!(
            config.env,
            vec!["PATH=/usr/local/bin:/usr/bin", "PYTHONPATH=/opt/lib"]
        );
        assert_eq!(config.history.len(), 2);
        assert_eq!(
            config.history[0].created_by,
            "/bin/sh -c #(nop) ADD file:abc in /"
        );
        assert_eq!(
            config.history[0].created.as_deref(),
            Some("2023-01-01T00:00:00Z")
        );
        assert_eq!(config.history[1].empty_layer, Some(true));
        assert_eq!(config.env_var("PYTHONPATH"), Some("/opt/lib"));
        assert_eq!(config.env_var("HOME"), None);
    }

    #[test]
    fn test_parse_config_error_names_image() {
        let err = parse_config(b"not json", "broken:1").unwrap_err();
        assert!(matches!(err, Error::ConfigParse { ref image, .. } if image == "broken:1"));
    }

    #[test]
    fn test_cleanup_removes_owned_dir_only() {
        let owned = TempDir::new().unwrap();
        let owned_path = owned.path().to_path_buf();
        let image = Image::new("a", owned, ConfigSchema::default());
        image.cleanup().unwrap();
        assert!(!owned_path.exists());

        let borrowed = TempDir::new().unwrap();
        let image = Image::from_path("b", borrowed.path(), ConfigSchema::default());
        image.cleanup().unwrap();
        assert!(borrowed.path().exists());
    }

    #[test]
    fn test_preserve_keeps_dir() {
        let owned = TempDir::new().unwrap();
        let image = Image::new("a", owned, ConfigSchema::default());
        let kept = image.preserve();
        assert!(kept.exists());
        std::fs::remove_dir_all(kept).unwrap();
    }
}
