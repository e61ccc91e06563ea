//! Invocation options shared by resolution, analysis and rendering.
//!
//! [`Options`] is built once by the caller (normally the CLI) and passed by
//! reference to everything that needs it.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

pub const DEFAULT_ANALYZER: &str = "apt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Analyzer names to run; iteration order is the render order.
    pub analyzers: BTreeSet<String>,
    /// Order entries by size descending instead of by name.
    pub sort_by_size: bool,
    /// Keep materialized filesystems instead of removing them on exit.
    pub preserve_filesystem: bool,
    pub format: OutputFormat,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            analyzers: BTreeSet::from([DEFAULT_ANALYZER.to_string()]),
            sort_by_size: false,
            preserve_filesystem: false,
            format: OutputFormat::Text,
        }
    }
}

impl Options {
    /// Builds the analyzer set from raw CLI values, each of which may itself be
    /// a comma separated list.
    pub fn with_analyzers<I, S>(mut self, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed: BTreeSet<String> = names
            .into_iter()
            .flat_map(|raw| {
                raw.as_ref()
                    .split(',')
                    .map(|n| n.trim().to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|n| !n.is_empty())
            .collect();

        if parsed.is_empty() {
            return Err(Error::UnknownAnalyzer(String::new()));
        }
        self.analyzers = parsed;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_runs_apt_as_text() {
        let options = Options::default();
        assert_eq!(options.analyzers.len(), 1);
        assert!(options.analyzers.contains("apt"));
        assert_eq!(options.format, OutputFormat::Text);
        assert!(!options.sort_by_size);
        assert!(!options.preserve_filesystem);
    }

    #[test]
    fn test_with_analyzers_splits_and_sorts() {
        let options = Options::default()
            .with_analyzers(["pip,node", "file", " apt "])
            .unwrap();
        let names: Vec<&str> = options.analyzers.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["apt", "file", "node", "pip"]);
    }

    #[test]
    fn test_with_analyzers_rejects_empty() {
        assert!(Options::default().with_analyzers([",", ""]).is_err());
    }
}
