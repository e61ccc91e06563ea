//! Analyzer framework.
//!
//! An [`Analyzer`] compares two images ([`Analyzer::diff`]) or lists the
//! contents of one ([`Analyzer::analyze`]) within a single domain: files,
//! one package manager, or build history. Analyzers are looked up by name in
//! an [`AnalyzerRegistry`]; names are unique.

mod apt;
mod file;
mod history;
mod node;
mod package;
mod pip;

pub use apt::Apt;
pub use file::{FileAnalyzer, FileDiff, FileEntry, FileModification};
pub use history::{HistoryAnalyzer, HistoryDiff, HistoryStep, Op};
pub use node::Node;
pub use package::{
    InfoDiff, PackageAnalyzer, PackageDiff, PackageEntry, PackageInfo, PackageManager, PackageMap,
};
pub use pip::Pip;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::Options;
use crate::error::{Error, Result};
use crate::image::{HistoryItem, Image};

pub trait Analyzer: Send + Sync {
    /// Registry key, e.g. `apt`.
    fn name(&self) -> &'static str;

    fn diff(&self, image1: &Image, image2: &Image, options: &Options) -> Result<AnalysisResult>;

    fn analyze(&self, image: &Image, options: &Options) -> Result<AnalysisResult>;
}

/// What an analyzer runs against.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Single(&'a Image),
    Pair(&'a Image, &'a Image),
}

/// Two-image comparison payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffResult<T> {
    #[serde(rename = "Image1")]
    pub image1: String,
    #[serde(rename = "Image2")]
    pub image2: String,
    #[serde(rename = "DiffType")]
    pub diff_type: String,
    #[serde(rename = "Diff")]
    pub diff: T,
}

/// Single-image listing payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzeResult<T> {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "AnalyzeType")]
    pub analyze_type: String,
    #[serde(rename = "Analysis")]
    pub analysis: T,
}

/// The output of one analyzer run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnalysisResult {
    FileDiff(DiffResult<FileDiff>),
    FileAnalysis(AnalyzeResult<Vec<FileEntry>>),
    PackageDiff(DiffResult<PackageDiff>),
    PackageAnalysis(AnalyzeResult<Vec<PackageEntry>>),
    HistoryDiff(DiffResult<HistoryDiff>),
    HistoryAnalysis(AnalyzeResult<Vec<HistoryItem>>),
}

impl AnalysisResult {
    /// `Apt`, `File`, ... as shown in banners and the `DiffType` field.
    pub fn kind(&self) -> &str {
        match self {
            AnalysisResult::FileDiff(r) => &r.diff_type,
            AnalysisResult::PackageDiff(r) => &r.diff_type,
            AnalysisResult::HistoryDiff(r) => &r.diff_type,
            AnalysisResult::FileAnalysis(r) => &r.analyze_type,
            AnalysisResult::PackageAnalysis(r) => &r.analyze_type,
            AnalysisResult::HistoryAnalysis(r) => &r.analyze_type,
        }
    }
}

/// Capitalized analyzer name, `apt` → `Apt`.
pub fn display_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub struct AnalyzerRegistry {
    analyzers: BTreeMap<String, Box<dyn Analyzer>>,
}

impl Default for AnalyzerRegistry {
    /// Every built-in analyzer.
    fn default() -> Self {
        let builtin: Vec<Box<dyn Analyzer>> = vec![
            Box::new(PackageAnalyzer::new(Apt)),
            Box::new(FileAnalyzer),
            Box::new(HistoryAnalyzer),
            Box::new(PackageAnalyzer::new(Node)),
            Box::new(PackageAnalyzer::new(Pip)),
        ];
        Self {
            analyzers: builtin
                .into_iter()
                .map(|a| (a.name().to_string(), a))
                .collect(),
        }
    }
}

impl AnalyzerRegistry {
    pub fn empty() -> Self {
        Self {
            analyzers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, analyzer: Box<dyn Analyzer>) -> Result<()> {
        let name = analyzer.name().to_string();
        if self.analyzers.contains_key(&name) {
            return Err(Error::DuplicateAnalyzer(name));
        }
        self.analyzers.insert(name, analyzer);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&dyn Analyzer> {
        self.analyzers
            .get(name)
            .map(|a| a.as_ref())
            .ok_or_else(|| Error::UnknownAnalyzer(name.to_string()))
    }

    /// Rejects the first requested name that is not registered.
    pub fn validate(&self, names: &BTreeSet<String>) -> Result<()> {
        match names.iter().find(|n| !self.analyzers.contains_key(*n)) {
            Some(unknown) => Err(Error::UnknownAnalyzer(unknown.clone())),
            None => Ok(()),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.analyzers.keys().map(String::as_str)
    }
}

/// Runs the analyzer registered as `name` against `target`.
pub fn run_analyzer(
    registry: &AnalyzerRegistry,
    name: &str,
    target: Target<'_>,
    options: &Options,
) -> Result<AnalysisResult> {
    let analyzer = registry.get(name)?;
    match target {
        Target::Single(image) => {
            log::info!("Running {} analysis on {}", name, image.source());
            analyzer.analyze(image, options)
        }
        Target::Pair(image1, image2) => {
            log::info!(
                "Running {} diff on {} and {}",
                name,
                image1.source(),
                image2.source()
            );
            analyzer.diff(image1, image2, options)
        }
    }
}

/// Orders by key, or by size descending then key when sorting by size.
pub(crate) fn sort_entries<T, F>(entries: &mut [T], options: &Options, key: F)
where
    F: Fn(&T) -> (&str, u64),
{
    if options.sort_by_size {
        entries.sort_by(|a, b| {
            let (name_a, size_a) = key(a);
            let (name_b, size_b) = key(b);
            size_b.cmp(&size_a).then_with(|| name_a.cmp(name_b))
        });
    } else {
        entries.sort_by(|a, b| key(a).0.cmp(key(b).0));
    }
}

/// Total size of regular files under `path`, without following links.
pub(crate) fn disk_usage(path: &Path) -> u64 {
    let is_link = fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(true);
    if is_link {
        return 0;
    }
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|m| m.len())
        .sum()
}
