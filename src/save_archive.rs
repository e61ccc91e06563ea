//! Reading `docker save` style image archives.
//!
//! A save archive is a tar holding `manifest.json`, the config blob and one
//! blob per layer, either in the legacy `<id>/layer.tar` layout or the OCI
//! `blobs/sha256/<hex>` layout. [`SaveArchive::stage`] unpacks the outer tar
//! into a scratch directory, after which layers can be applied directly
//! ([`SaveArchive::apply_layers`]) or served to the concurrent pipeline
//! through [`SaveArchive::fetcher`].

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar_rs as tar;
use tempfile::TempDir;

use crate::compression;
use crate::error::{Error, Result};
use crate::image::{self, ConfigSchema, LayerInfo};
use crate::layers::BlobFetcher;
use crate::tar_extractor;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(default, rename = "RepoTags")]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// Derives a layer digest from its path inside a save archive.
pub fn digest_from_layer_path<P: AsRef<Path>>(layer_path: P) -> String {
    let path = layer_path.as_ref();

    if let Some(parent) = path.parent() {
        // blobs/sha256/<hex>
        if parent.file_name().and_then(|s| s.to_str()) == Some("sha256") {
            if let Some(hex) = path.file_name().and_then(|s| s.to_str()) {
                return format!("sha256:{}", hex);
            }
        }
        // <hex>/layer.tar
        if path.file_name().and_then(|s| s.to_str()) == Some("layer.tar") {
            if let Some(id) = parent.file_name().and_then(|s| s.to_str()) {
                return format!("sha256:{}", id);
            }
        }
    }

    match path.file_name().and_then(|s| s.to_str()) {
        Some(name) if name.starts_with("sha256:") => name.to_string(),
        Some(name) => format!("sha256:{}", name),
        None => "unknown".to_string(),
    }
}

fn parse_manifest(content: &[u8]) -> Result<ManifestEntry> {
    let entries: Vec<ManifestEntry> = serde_json::from_slice(content)
        .map_err(|e| Error::archive(format!("invalid manifest.json: {}", e)))?;
    let manifest = entries
        .into_iter()
        .next()
        .ok_or_else(|| Error::archive("empty manifest.json"))?;

    archive_relative(&manifest.config)?;
    for layer in &manifest.layers {
        archive_relative(layer)?;
    }
    Ok(manifest)
}

/// A manifest path as a relative path inside the archive. Absolute paths and
/// `..` are refused.
fn archive_relative(member: &str) -> Result<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(member).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::archive(format!(
                    "manifest path escapes archive: {}",
                    member
                )));
            }
        }
    }
    if rel.as_os_str().is_empty() {
        return Err(Error::archive("empty path in manifest.json"));
    }
    Ok(rel)
}

/// Resolves a manifest path to a regular file under `root` without passing
/// through any link.
fn staged_member(root: &Path, member: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for component in archive_relative(member)?.components() {
        path.push(component);
        let meta = fs::symlink_metadata(&path).map_err(|e| {
            Error::archive(format!("{} not found in archive: {}", member, e))
        })?;
        if meta.file_type().is_symlink() {
            return Err(Error::archive(format!(
                "manifest path resolves through a link: {}",
                member
            )));
        }
    }
    if !path.is_file() {
        return Err(Error::archive(format!("{} is not a file", member)));
    }
    Ok(path)
}

fn without_cur_dir(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Returns the contents of the member at `wanted`, scanning the archive once.
fn read_member(tarball: &Path, wanted: &Path) -> Result<Option<Vec<u8>>> {
    let reader = compression::decoded_reader(File::open(tarball)?)
        .map_err(|reason| Error::archive(format!("{}: {}", tarball.display(), reason)))?;
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if without_cur_dir(&entry.path()?) == wanted {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(Some(content));
        }
    }
    Ok(None)
}

/// Reads the image config out of a save archive without unpacking its layers.
pub fn read_config(tarball: &Path, image_name: &str) -> Result<ConfigSchema> {
    let manifest = read_member(tarball, Path::new(MANIFEST_FILE))?
        .ok_or_else(|| Error::archive("manifest.json not found in archive"))?;
    let manifest = parse_manifest(&manifest)?;

    let config_path = archive_relative(&manifest.config)?;
    let blob = read_member(tarball, &config_path)?.ok_or_else(|| Error::ConfigParse {
        image: image_name.to_string(),
        reason: format!("config blob {} missing from archive", manifest.config),
    })?;
    image::parse_config(&blob, image_name)
}

pub struct SaveArchive {
    _staging: Option<TempDir>,
    manifest: ManifestEntry,
    /// Staged blob of each manifest layer, same order.
    layer_paths: Vec<PathBuf>,
}

impl SaveArchive {
    /// Unpacks the archive at `tarball` into a private staging directory.
    pub fn stage(tarball: &Path) -> Result<Self> {
        let staging = TempDir::new()?;
        log::debug!(
            "Staging image archive {} in {}",
            tarball.display(),
            staging.path().display()
        );

        let file = File::open(tarball)?;
        let reader = compression::decoded_reader(file).map_err(|reason| {
            Error::archive(format!("{}: {}", tarball.display(), reason))
        })?;
        tar::Archive::new(reader)
            .unpack(staging.path())
            .map_err(|e| Error::archive(format!("failed to unpack {}: {}", tarball.display(), e)))?;

        let mut archive = Self::from_dir(staging.path())?;
        archive._staging = Some(staging);
        Ok(archive)
    }

    /// Opens an already unpacked archive. Every layer named by the manifest
    /// must be a regular file inside `root`.
    pub fn from_dir(root: &Path) -> Result<Self> {
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(Error::archive(
                "manifest.json not found; this does not appear to be a docker save archive",
            ));
        }
        let manifest = parse_manifest(&fs::read(&manifest_path)?)?;
        let layer_paths = manifest
            .layers
            .iter()
            .map(|layer| staged_member(root, layer))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            _staging: None,
            manifest,
            layer_paths,
        })
    }

    pub fn repo_tags(&self) -> &[String] {
        self.manifest.repo_tags.as_deref().unwrap_or_default()
    }

    /// Layers in manifest order, oldest first.
    pub fn layers(&self) -> Vec<LayerInfo> {
        self.manifest
            .layers
            .iter()
            .zip(&self.layer_paths)
            .map(|(rel, path)| {
                let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                LayerInfo::new(digest_from_layer_path(rel), size)
            })
            .collect()
    }

    /// Applies every layer onto `dest` one after another.
    pub fn apply_layers(&self, dest: &Path) -> Result<()> {
        let total = self.layer_paths.len();
        for (index, (rel, path)) in self.manifest.layers.iter().zip(&self.layer_paths).enumerate() {
            let digest = digest_from_layer_path(rel);
            log::debug!("Applying layer {}/{}: {}", index + 1, total, digest);
            tar_extractor::unpack_layer_file(path, dest, &digest)?;
        }
        Ok(())
    }

    /// Serves this archive's layer blobs to the layer pipeline.
    pub fn fetcher(self) -> Arc<LocalBlobFetcher> {
        let blobs = self
            .manifest
            .layers
            .iter()
            .zip(&self.layer_paths)
            .map(|(rel, path)| (digest_from_layer_path(rel), path.clone()))
            .collect();
        Arc::new(LocalBlobFetcher {
            blobs,
            _archive: self,
        })
    }
}

/// Blob fetcher reading layers from a staged save archive.
pub struct LocalBlobFetcher {
    blobs: HashMap<String, PathBuf>,
    _archive: SaveArchive,
}

#[async_trait]
impl BlobFetcher for LocalBlobFetcher {
    async fn fetch_blob(&self, layer: &LayerInfo) -> Result<Vec<u8>> {
        let path = self.blobs.get(&layer.digest).ok_or_else(|| Error::LayerFetch {
            digest: layer.digest.clone(),
            reason: "layer not present in archive".to_string(),
        })?;
        tokio::fs::read(path).await.map_err(|e| Error::LayerFetch {
            digest: layer.digest.clone(),
            reason: format!("failed to read {}: {}", path.display(), e),
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::test_utils::{gzip, layer_tar, Entry, MINIMAL_CONFIG};
    use std::path::Path;
    use tar_rs as tar;

    fn append(builder: &mut tar::Builder<std::fs::File>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, data).unwrap();
    }

    /// Writes a two-layer save archive: a legacy plain layer followed by a
    /// gzipped OCI blob that whiteouts one of the base files.
    pub fn write_save_archive(path: &Path) {
        let base = layer_tar(&[
            Entry::File("etc/os-release", b"ID=test"),
            Entry::File("tmp/scratch", b"temporary"),
        ]);
        let top = gzip(&layer_tar(&[
            Entry::File("app/main", b"binary"),
            Entry::File("tmp/.wh.scratch", b""),
        ]));
        let manifest = r#"[{
            "Config": "config.json",
            "RepoTags": ["fixture:latest"],
            "Layers": ["1111/layer.tar", "blobs/sha256/2222"]
        }]"#;

        let mut builder = tar::Builder::new(std::fs::File::create(path).unwrap());
        append(&mut builder, "manifest.json", manifest.as_bytes());
        append(&mut builder, "config.json", MINIMAL_CONFIG.as_bytes());
        append(&mut builder, "1111/layer.tar", &base);
        append(&mut builder, "blobs/sha256/2222", &top);
        builder.finish().unwrap();
    }
}
