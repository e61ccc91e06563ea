use async_trait::async_trait;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::OciDescriptor;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;

use super::{naming, Source};
use crate::cancel::CancelSignal;
use crate::error::{Error, Result};
use crate::image::{self, ConfigSchema, LayerInfo};
use crate::layers::{BlobFetcher, LayerPipeline};
use crate::notifier::Notifier;

/// Reads credentials from `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`,
/// falling back to anonymous access.
fn auth_from_env() -> RegistryAuth {
    match (
        std::env::var("REGISTRY_USERNAME").ok(),
        std::env::var("REGISTRY_PASSWORD").ok(),
    ) {
        (Some(username), Some(password)) => RegistryAuth::Basic(username, password),
        _ => RegistryAuth::Anonymous,
    }
}

/// Pulls images directly from OCI-compliant registries.
pub struct RegistrySource {
    client: Client,
    auth: RegistryAuth,
    runtime: Runtime,
    notifier: Arc<Notifier>,
}

impl RegistrySource {
    pub fn new(notifier: Arc<Notifier>) -> Result<Self> {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            client: Client::new(config),
            auth: auth_from_env(),
            runtime,
            notifier,
        })
    }

    fn parse_reference(&self, identifier: &str) -> Result<Reference> {
        Reference::try_from(identifier).map_err(|e| {
            Error::source_failure(
                self.name(),
                identifier,
                format!("invalid image reference: {}", e),
            )
        })
    }
}

impl Source for RegistrySource {
    fn name(&self) -> &str {
        "registry"
    }

    fn supports_image(&self, identifier: &str) -> bool {
        !naming::looks_like_tar_path(identifier) && Reference::try_from(identifier).is_ok()
    }

    fn materialize_filesystem(
        &self,
        identifier: &str,
        dest: &Path,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let reference = self.parse_reference(identifier)?;
        self.notifier
            .info(&format!("Pulling image '{}' from registry...", reference));

        self.runtime.block_on(async {
            let (manifest, digest) = self
                .client
                .pull_image_manifest(&reference, &self.auth)
                .await
                .map_err(|e| {
                    Error::source_failure(
                        self.name(),
                        identifier,
                        format!("failed to pull manifest: {}", e),
                    )
                })?;
            log::debug!(
                "Pulled manifest {} with {} layers",
                digest,
                manifest.layers.len()
            );

            let layers: Vec<LayerInfo> = manifest
                .layers
                .iter()
                .map(|d| LayerInfo::new(d.digest.clone(), d.size.max(0) as u64))
                .collect();
            let fetcher = Arc::new(RegistryFetcher {
                client: self.client.clone(),
                reference: reference.clone(),
                descriptors: manifest
                    .layers
                    .into_iter()
                    .map(|d| (d.digest.clone(), d))
                    .collect(),
            });

            let progress = self
                .notifier
                .create_progress_bar(layers.len() as u64, identifier);
            let result = LayerPipeline::new(fetcher, cancel.clone())
                .with_progress(progress.clone())
                .materialize(&layers, dest)
                .await;
            if let Some(pb) = progress {
                pb.finish_and_clear();
            }
            result
        })
    }

    fn extract_config(&self, identifier: &str) -> Result<ConfigSchema> {
        let reference = self.parse_reference(identifier)?;
        let (_, _, config) = self
            .runtime
            .block_on(self.client.pull_manifest_and_config(&reference, &self.auth))
            .map_err(|e| {
                Error::source_failure(
                    self.name(),
                    identifier,
                    format!("failed to pull config blob: {}", e),
                )
            })?;
        image::parse_config(config.as_bytes(), identifier)
    }
}

/// Fetches layer blobs of one image reference by digest.
struct RegistryFetcher {
    client: Client,
    reference: Reference,
    descriptors: HashMap<String, OciDescriptor>,
}

#[async_trait]
impl BlobFetcher for RegistryFetcher {
    async fn fetch_blob(&self, layer: &LayerInfo) -> Result<Vec<u8>> {
        let descriptor = self
            .descriptors
            .get(&layer.digest)
            .ok_or_else(|| Error::LayerFetch {
                digest: layer.digest.clone(),
                reason: "layer not listed in manifest".to_string(),
            })?;

        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&self.reference, descriptor, &mut data)
            .await
            .map_err(|e| Error::LayerFetch {
                digest: layer.digest.clone(),
                reason: e.to_string(),
            })?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> RegistrySource {
        RegistrySource::new(Arc::new(Notifier::new(1))).unwrap()
    }

    #[test]
    fn test_supports_references_but_not_archives() {
        let source = source();
        assert!(source.supports_image("ubuntu:20.04"));
        assert!(source.supports_image("gcr.io/project/app:v1"));
        assert!(source.supports_image(
            "alpine@sha256:0000000000000000000000000000000000000000000000000000000000000000"
        ));
        assert!(!source.supports_image("image.tar"));
        assert!(!source.supports_image("Not A Reference"));
    }

    #[test]
    fn test_invalid_reference_is_a_source_failure() {
        let err = source()
            .extract_config("Not A Reference")
            .unwrap_err();
        assert!(matches!(err, Error::Source { ref source_name, .. } if source_name == "registry"));
    }
}
