pub mod analyzers;
pub mod cancel;
pub mod compression;
pub mod config;
pub mod error;
pub mod image;
pub mod layers;
pub mod notifier;
pub mod output;
pub mod processor;
pub mod save_archive;
pub mod sources;
pub mod tar_extractor;

#[cfg(test)]
mod test_utils;

// Re-exports for easy access
pub use analyzers::{AnalysisResult, Analyzer, AnalyzerRegistry};
pub use cancel::CancelSignal;
pub use config::{Options, OutputFormat};
pub use error::{Error, Result};
pub use image::{ConfigSchema, HistoryItem, Image};
pub use notifier::Notifier;
pub use output::ResultSet;
pub use processor::{Processor, Report, Request};
pub use sources::{DaemonSource, RegistrySource, Resolver, Source, TarSource};
