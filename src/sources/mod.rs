//! Image sources and the resolver that picks between them.
//!
//! Three sources exist, tried in a fixed priority order: the local daemon,
//! a remote registry, and a local `docker save` archive. An identifier
//! prefixed with [`DAEMON_PREFIX`] or [`REMOTE_PREFIX`] is routed to that
//! source alone. Otherwise every source that claims the identifier is tried
//! in turn until one of them materializes it.

mod docker;
mod naming;
mod registry;
mod source;
mod tar;

pub use docker::DaemonSource;
pub use naming::{DAEMON_PREFIX, REMOTE_PREFIX};
pub use registry::RegistrySource;
pub use source::Source;
pub use tar::TarSource;

use std::future::Future;
use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::notifier::Notifier;

/// Runs `future` to completion on a fresh runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

pub struct Resolver {
    daemon: Box<dyn Source>,
    registry: Box<dyn Source>,
    tar: Box<dyn Source>,
}

impl Resolver {
    pub fn new(notifier: Arc<Notifier>) -> Result<Self> {
        Ok(Self::with_sources(
            Box::new(DaemonSource::new(Arc::clone(&notifier))),
            Box::new(RegistrySource::new(notifier)?),
            Box::new(TarSource::new()),
        ))
    }

    /// Builds a resolver over explicit daemon, registry and tar sources.
    pub fn with_sources(
        daemon: Box<dyn Source>,
        registry: Box<dyn Source>,
        tar: Box<dyn Source>,
    ) -> Self {
        Self {
            daemon,
            registry,
            tar,
        }
    }

    /// Materializes `identifier` into a fresh directory and reads its config.
    pub fn resolve(&self, identifier: &str, cancel: &CancelSignal) -> Result<Image> {
        if let Some(stripped) = identifier.strip_prefix(DAEMON_PREFIX) {
            return self.resolve_exclusive(self.daemon.as_ref(), stripped, cancel);
        }
        if let Some(stripped) = identifier.strip_prefix(REMOTE_PREFIX) {
            return self.resolve_exclusive(self.registry.as_ref(), stripped, cancel);
        }

        let mut attempts = Vec::new();
        for source in [&self.daemon, &self.registry, &self.tar] {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !source.supports_image(identifier) {
                log::debug!("{} source does not handle '{}'", source.name(), identifier);
                attempts.push(format!("{}: not supported", source.name()));
                continue;
            }

            match prepare(&**source, identifier, cancel) {
                Ok(image) => return Ok(image),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    log::warn!(
                        "{} source failed for '{}', trying the next one: {}",
                        source.name(),
                        identifier,
                        e
                    );
                    attempts.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        Err(Error::SourceUnresolved {
            image: identifier.to_string(),
            attempts,
        })
    }

    fn resolve_exclusive(
        &self,
        source: &dyn Source,
        identifier: &str,
        cancel: &CancelSignal,
    ) -> Result<Image> {
        log::debug!("Resolving '{}' through {} source only", identifier, source.name());
        prepare(source, identifier, cancel).map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => Error::SourceUnresolved {
                image: identifier.to_string(),
                attempts: vec![format!("{}: {}", source.name(), other)],
            },
        })
    }
}

/// Runs one source end to end. The directory is dropped on any failure.
fn prepare(source: &dyn Source, identifier: &str, cancel: &CancelSignal) -> Result<Image> {
    let workdir = tempfile::Builder::new()
        .prefix(&naming::workdir_prefix(identifier))
        .tempdir()?;
    log::info!(
        "Materializing '{}' with {} source into {}",
        identifier,
        source.name(),
        workdir.path().display()
    );

    source.materialize_filesystem(identifier, workdir.path(), cancel)?;
    let config = source.extract_config(identifier)?;
    Ok(Image::new(identifier, workdir, config))
}
