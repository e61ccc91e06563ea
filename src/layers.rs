//! Layer acquisition pipeline.
//!
//! [`LayerPipeline::materialize`] turns an ordered list of [`LayerInfo`] into a
//! single merged filesystem in two phases:
//!
//! 1. **Fetch**: one worker per layer pulls the blob through a [`BlobFetcher`],
//!    sniffs its compression and stages the decompressed tar in a private
//!    scratch directory. Workers share nothing, so they run concurrently.
//!    Every worker is awaited before success or failure is decided, and all
//!    failures are reported together.
//! 2. **Apply**: staged layers are unpacked into the destination strictly in
//!    layer order, each one finishing before the next starts. Whiteouts and
//!    overwrites depend on this order.
//!
//! Cancellation aborts in-flight fetches and stops application at the next
//! layer boundary.

use async_trait::async_trait;
use indicatif::ProgressBar;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinSet;

use crate::cancel::CancelSignal;
use crate::compression;
use crate::error::{Error, Result};
use crate::image::LayerInfo;
use crate::tar_extractor;

/// Capability to retrieve a layer blob by its descriptor.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Returns the raw (possibly compressed) blob bytes.
    async fn fetch_blob(&self, layer: &LayerInfo) -> Result<Vec<u8>>;
}

pub struct LayerPipeline {
    fetcher: Arc<dyn BlobFetcher>,
    cancel: CancelSignal,
    progress: Option<ProgressBar>,
}

impl LayerPipeline {
    pub fn new(fetcher: Arc<dyn BlobFetcher>, cancel: CancelSignal) -> Self {
        Self {
            fetcher,
            cancel,
            progress: None,
        }
    }

    /// Advances `progress` once per fetched layer.
    pub fn with_progress(mut self, progress: Option<ProgressBar>) -> Self {
        self.progress = progress;
        self
    }

    /// Fetches every layer and applies them in order onto `dest`.
    pub async fn materialize(&self, layers: &[LayerInfo], dest: &Path) -> Result<()> {
        log::info!(
            "Fetching {} layers into {}",
            layers.len(),
            dest.display()
        );
        let scratch = TempDir::new()?;
        let staged = self.fetch_all(layers, scratch.path()).await?;
        self.apply_in_order(layers, staged, dest).await
    }

    async fn fetch_all(&self, layers: &[LayerInfo], scratch: &Path) -> Result<Vec<PathBuf>> {
        let mut workers = JoinSet::new();
        for (index, layer) in layers.iter().cloned().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let cancel = self.cancel.clone();
            let progress = self.progress.clone();
            let staged_path = scratch.join(format!("layer-{:04}.tar", index));
            workers.spawn(async move {
                let result = fetch_and_stage(fetcher.as_ref(), &layer, staged_path, &cancel).await;
                if result.is_ok() {
                    if let Some(pb) = &progress {
                        pb.inc(1);
                    }
                }
                (index, result)
            });
        }

        let mut staged: Vec<Option<PathBuf>> = vec![None; layers.len()];
        let mut failures: Vec<(usize, Error)> = Vec::new();
        let mut aborted: Vec<String> = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, Ok(path))) => staged[index] = Some(path),
                Ok((index, Err(e))) => failures.push((index, e)),
                Err(join_err) => aborted.push(join_err.to_string()),
            }
        }

        if self.cancel.is_cancelled() {
            log::warn!("Layer fetch cancelled");
            return Err(Error::Cancelled);
        }

        if !aborted.is_empty() {
            let reported: Vec<usize> = failures.iter().map(|(i, _)| *i).collect();
            let reason = aborted.join("; ");
            for (index, slot) in staged.iter().enumerate() {
                if slot.is_none() && !reported.contains(&index) {
                    failures.push((
                        index,
                        Error::LayerFetch {
                            digest: layers[index].digest.clone(),
                            reason: format!("fetch worker aborted: {}", reason),
                        },
                    ));
                }
            }
        }

        if !failures.is_empty() {
            failures.sort_by_key(|(index, _)| *index);
            for (index, err) in &failures {
                log::error!("Layer {} failed: {}", index, err);
            }
            return Err(Error::LayerPipeline {
                total: layers.len(),
                failures: failures.into_iter().map(|(_, e)| e).collect(),
            });
        }

        Ok(staged.into_iter().flatten().collect())
    }

    async fn apply_in_order(
        &self,
        layers: &[LayerInfo],
        staged: Vec<PathBuf>,
        dest: &Path,
    ) -> Result<()> {
        let total = layers.len();
        for (index, (layer, path)) in layers.iter().zip(staged).enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!(
                    "Cancelled after applying {}/{} layers",
                    index,
                    total
                );
                return Err(Error::Cancelled);
            }

            let dest = dest.to_path_buf();
            let digest = layer.digest.clone();
            tokio::task::spawn_blocking(move || apply_staged(&path, &dest, &digest))
                .await
                .map_err(|e| Error::Archive {
                    digest: Some(layer.digest.clone()),
                    reason: e.to_string(),
                })??;
            log::debug!("Applied layer {}/{}: {}", index + 1, total, layer.digest);
        }
        Ok(())
    }
}

async fn fetch_and_stage(
    fetcher: &dyn BlobFetcher,
    layer: &LayerInfo,
    staged_path: PathBuf,
    cancel: &CancelSignal,
) -> Result<PathBuf> {
    let blob = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        fetched = fetcher.fetch_blob(layer) => fetched?,
    };
    log::debug!("Fetched layer {} ({} bytes)", layer.digest, blob.len());

    let digest = layer.digest.clone();
    tokio::task::spawn_blocking(move || {
        decompress_to(blob, &staged_path, &digest)?;
        Ok::<_, Error>(staged_path)
    })
    .await
    .map_err(|e| Error::Decompression {
        digest: layer.digest.clone(),
        reason: e.to_string(),
    })?
}

fn decompress_to(blob: Vec<u8>, staged_path: &Path, digest: &str) -> Result<()> {
    let mut reader =
        compression::decoded_reader(Cursor::new(blob)).map_err(|reason| Error::Decompression {
            digest: digest.to_string(),
            reason,
        })?;
    let mut out = BufWriter::new(File::create(staged_path)?);
    std::io::copy(&mut reader, &mut out).map_err(|e| Error::Decompression {
        digest: digest.to_string(),
        reason: e.to_string(),
    })?;
    out.flush()?;
    Ok(())
}

fn apply_staged(path: &Path, dest: &Path, digest: &str) -> Result<()> {
    let file = File::open(path)?;
    tar_extractor::unpack_layer(BufReader::new(file), dest).map_err(|e| e.with_layer(digest))
}
