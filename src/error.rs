use thiserror::Error;

/// Errors produced while materializing, analyzing or rendering images.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not retrieve image '{image}' from any source ({})", .attempts.join("; "))]
    SourceUnresolved { image: String, attempts: Vec<String> },

    #[error("failed to fetch layer {digest}: {reason}")]
    LayerFetch { digest: String, reason: String },

    #[error("failed to decompress layer {digest}: {reason}")]
    Decompression { digest: String, reason: String },

    #[error("invalid layer archive{}: {reason}", fmt_digest(.digest))]
    Archive {
        digest: Option<String>,
        reason: String,
    },

    #[error("{} of {total} layers failed: {}", .failures.len(), join_errors(.failures))]
    LayerPipeline { total: usize, failures: Vec<Error> },

    #[error("could not parse config for image '{image}': {reason}")]
    ConfigParse { image: String, reason: String },

    #[error("analyzer '{analyzer}' cannot run against image '{image}': {reason}")]
    UnsupportedAnalyzer {
        analyzer: String,
        image: String,
        reason: String,
    },

    #[error("'{0}' is not a valid analyzer")]
    UnknownAnalyzer(String),

    #[error("analyzer '{0}' is already registered")]
    DuplicateAnalyzer(String),

    #[error("{source_name} source failed for '{image}': {reason}")]
    Source {
        source_name: String,
        image: String,
        reason: String,
    },

    #[error("failed to render {analyzer} result: {reason}")]
    Render { analyzer: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn archive(reason: impl Into<String>) -> Self {
        Error::Archive {
            digest: None,
            reason: reason.into(),
        }
    }

    pub(crate) fn source_failure(
        source_name: &str,
        image: &str,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::Source {
            source_name: source_name.to_string(),
            image: image.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Attaches a layer digest to archive errors raised while applying that layer.
    pub(crate) fn with_layer(self, layer_digest: &str) -> Self {
        match self {
            Error::Archive { digest: None, reason } => Error::Archive {
                digest: Some(layer_digest.to_string()),
                reason,
            },
            Error::Io(e) => Error::Archive {
                digest: Some(layer_digest.to_string()),
                reason: e.to_string(),
            },
            other => other,
        }
    }
}

fn fmt_digest(digest: &Option<String>) -> String {
    digest
        .as_deref()
        .map(|d| format!(" (layer {})", d))
        .unwrap_or_default()
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
