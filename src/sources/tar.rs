use std::path::Path;

use super::{naming, Source};
use crate::cancel::CancelSignal;
use crate::error::{Error, Result};
use crate::image::ConfigSchema;
use crate::save_archive::{self, SaveArchive};

/// Reads images from `docker save` archives on the local filesystem.
pub struct TarSource;

impl TarSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TarSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for TarSource {
    fn name(&self) -> &str {
        "tar"
    }

    fn supports_image(&self, identifier: &str) -> bool {
        naming::looks_like_tar_path(identifier) && Path::new(identifier).is_file()
    }

    fn materialize_filesystem(
        &self,
        identifier: &str,
        dest: &Path,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let tarball = Path::new(identifier);
        if !tarball.is_file() {
            return Err(Error::source_failure(
                self.name(),
                identifier,
                "tarball file does not exist",
            ));
        }

        log::info!("Unpacking image archive {}", tarball.display());
        let archive = SaveArchive::stage(tarball).map_err(|e| match e {
            Error::Archive { .. } => Error::source_failure(self.name(), identifier, e),
            other => other,
        })?;
        if !archive.repo_tags().is_empty() {
            log::debug!("Archive tags: {}", archive.repo_tags().join(", "));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        archive.apply_layers(dest)
    }

    fn extract_config(&self, identifier: &str) -> Result<ConfigSchema> {
        save_archive::read_config(Path::new(identifier), identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save_archive::fixtures::write_save_archive;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_supports_only_existing_archives() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("image.tar");
        write_save_archive(&tarball);
        let not_an_archive = dir.path().join("notes.txt");
        fs::write(&not_an_archive, "hello").unwrap();

        let source = TarSource::new();
        assert!(source.supports_image(tarball.to_str().unwrap()));
        assert!(!source.supports_image(not_an_archive.to_str().unwrap()));
        assert!(!source.supports_image("/does/not/exist.tar"));
        assert!(!source.supports_image("ubuntu:latest"));
    }

    #[test]
    fn test_materialize_and_config() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("image.tar");
        write_save_archive(&tarball);
        let id = tarball.to_str().unwrap();

        let dest = dir.path().join("rootfs");
        let source = TarSource::new();
        source
            .materialize_filesystem(id, &dest, &CancelSignal::new())
            .unwrap();
        assert!(dest.join("app/main").exists());
        assert!(!dest.join("tmp/scratch").exists());

        let config = source.extract_config(id).unwrap();
        assert_eq!(config.history.len(), 2);
    }

    #[test]
    fn test_archive_without_manifest_is_a_source_failure() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("broken.tar");
        fs::write(&tarball, crate::test_utils::layer_tar(&[])).unwrap();

        let err = TarSource::new()
            .materialize_filesystem(
                tarball.to_str().unwrap(),
                &dir.path().join("rootfs"),
                &CancelSignal::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Source { ref source_name, .. } if source_name == "tar"));
    }

    #[test]
    fn test_manifest_pointing_outside_archive_is_a_source_failure() {
        use crate::test_utils::{layer_tar, Entry};
        use tar_rs as tar;

        let dir = TempDir::new().unwrap();
        let host_layer = dir.path().join("host.tar");
        fs::write(&host_layer, layer_tar(&[Entry::File("leaked", b"host file")])).unwrap();

        let manifest = serde_json::json!([{
            "Config": "config.json",
            "Layers": [host_layer.to_string_lossy()],
        }])
        .to_string();
        let tarball = dir.path().join("crafted.tar");
        let mut builder = tar::Builder::new(fs::File::create(&tarball).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "manifest.json", manifest.as_bytes())
            .unwrap();
        builder.finish().unwrap();
        drop(builder);

        let dest = dir.path().join("rootfs");
        let err = TarSource::new()
            .materialize_filesystem(tarball.to_str().unwrap(), &dest, &CancelSignal::new())
            .unwrap_err();
        assert!(matches!(err, Error::Source { ref source_name, .. } if source_name == "tar"));
        assert!(!dest.join("leaked").exists());
    }
}
