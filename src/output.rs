//! Result aggregation and rendering.
//!
//! A [`ResultSet`] holds one outcome per requested analyzer, keyed by name so
//! that output order never depends on request or completion order. Structured
//! output is a pretty-printed JSON array; text output is one banner-prefixed
//! section per analyzer.

use indicatif::HumanBytes;
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::analyzers::{
    display_name, AnalysisResult, FileDiff, FileEntry, HistoryDiff, PackageDiff, PackageEntry,
};
use crate::config::OutputFormat;
use crate::error::{Error, Result};
use crate::image::HistoryItem;

#[derive(Default)]
pub struct ResultSet {
    results: BTreeMap<String, Result<AnalysisResult>>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, analyzer: impl Into<String>, outcome: Result<AnalysisResult>) {
        self.results.insert(analyzer.into(), outcome);
    }

    pub fn get(&self, analyzer: &str) -> Option<&Result<AnalysisResult>> {
        self.results.get(analyzer)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Names of analyzers that failed.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.results
            .iter()
            .filter_map(|(name, outcome)| outcome.as_ref().err().map(|e| (name.as_str(), e)))
    }

    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => self.render_structured(),
            OutputFormat::Text => Ok(self.render_text()),
        }
    }

    /// All successful results as one JSON array. Failed analyzers are left
    /// out with a warning; a result that cannot be serialized fails the
    /// whole payload.
    pub fn render_structured(&self) -> Result<String> {
        let mut payloads = Vec::with_capacity(self.results.len());
        for (name, outcome) in &self.results {
            match outcome {
                Ok(result) => payloads.push(result.render_structured(name)?),
                Err(e) => log::warn!("Omitting {} from output: {}", name, e),
            }
        }
        serde_json::to_string_pretty(&payloads).map_err(|e| Error::Render {
            analyzer: "all".to_string(),
            reason: e.to_string(),
        })
    }

    /// Every analyzer's section, failures reported inline.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for (name, outcome) in &self.results {
            let section = outcome
                .as_ref()
                .map_err(|e| e.to_string())
                .and_then(|result| result.render_text(name).map_err(|e| e.to_string()));
            match section {
                Ok(text) => out.push_str(&text),
                Err(reason) => {
                    let _ = writeln!(
                        out,
                        "\n-----{}-----\n\nError: {}",
                        display_name(name),
                        reason
                    );
                }
            }
        }
        out
    }
}

impl AnalysisResult {
    pub fn render_structured(&self, analyzer: &str) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::Render {
            analyzer: analyzer.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn render_text(&self, analyzer: &str) -> Result<String> {
        let mut out = String::new();
        render_into(self, &mut out).map_err(|e| Error::Render {
            analyzer: analyzer.to_string(),
            reason: e.to_string(),
        })?;
        Ok(out)
    }
}

fn render_into(result: &AnalysisResult, out: &mut String) -> std::fmt::Result {
    writeln!(out, "\n-----{}-----\n", result.kind())?;
    match result {
        AnalysisResult::FileDiff(r) => file_diff(out, &r.image1, &r.image2, &r.diff),
        AnalysisResult::FileAnalysis(r) => {
            writeln!(out, "Analysis for {}:", r.image)?;
            file_entries(out, &r.analysis)
        }
        AnalysisResult::PackageDiff(r) => package_diff(out, &r.image1, &r.image2, &r.diff),
        AnalysisResult::PackageAnalysis(r) => {
            writeln!(out, "Packages found in {}:", r.image)?;
            packages(out, &r.analysis)
        }
        AnalysisResult::HistoryDiff(r) => history_diff(out, &r.image1, &r.image2, &r.diff),
        AnalysisResult::HistoryAnalysis(r) => {
            writeln!(out, "Analysis for {}:", r.image)?;
            history(out, &r.analysis)
        }
    }
}

/// Left-aligned columns separated by three spaces.
fn table(out: &mut String, headers: &[&str], rows: &[Vec<String>]) -> std::fmt::Result {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut line = |cells: Vec<&str>| -> std::fmt::Result {
        let mut text = String::new();
        for (i, (cell, width)) in cells.iter().zip(&widths).enumerate() {
            if i + 1 == cells.len() {
                text.push_str(cell);
            } else {
                let _ = write!(text, "{:<width$}   ", cell, width = *width);
            }
        }
        writeln!(out, "{}", text.trim_end())
    };

    line(headers.to_vec())?;
    for row in rows {
        line(row.iter().map(String::as_str).collect())?;
    }
    Ok(())
}

fn human(size: u64) -> String {
    HumanBytes(size).to_string()
}

fn file_entries(out: &mut String, entries: &[FileEntry]) -> std::fmt::Result {
    if entries.is_empty() {
        return writeln!(out, "None");
    }
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| vec![e.name.clone(), human(e.size)])
        .collect();
    table(out, &["FILE", "SIZE"], &rows)
}

fn file_diff(out: &mut String, image1: &str, image2: &str, diff: &FileDiff) -> std::fmt::Result {
    writeln!(out, "These entries have been added to {}:", image2)?;
    file_entries(out, &diff.adds)?;
    writeln!(out, "\nThese entries have been deleted from {}:", image1)?;
    file_entries(out, &diff.dels)?;
    writeln!(out, "\nThese entries have been changed between {} and {}:", image1, image2)?;
    if diff.mods.is_empty() {
        return writeln!(out, "None");
    }
    let rows: Vec<Vec<String>> = diff
        .mods
        .iter()
        .map(|m| vec![m.name.clone(), human(m.size1), human(m.size2)])
        .collect();
    table(out, &["FILE", "SIZE1", "SIZE2"], &rows)
}

fn packages(out: &mut String, entries: &[PackageEntry]) -> std::fmt::Result {
    if entries.is_empty() {
        return writeln!(out, "None");
    }
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|p| vec![p.name.clone(), p.version.clone(), human(p.size)])
        .collect();
    table(out, &["NAME", "VERSION", "SIZE"], &rows)
}

fn package_diff(
    out: &mut String,
    image1: &str,
    image2: &str,
    diff: &PackageDiff,
) -> std::fmt::Result {
    writeln!(out, "Packages found only in {}:", image1)?;
    packages(out, &diff.packages1)?;
    writeln!(out, "\nPackages found only in {}:", image2)?;
    packages(out, &diff.packages2)?;
    writeln!(out, "\nVersion differences:")?;
    if diff.info_diff.is_empty() {
        return writeln!(out, "None");
    }
    let rows: Vec<Vec<String>> = diff
        .info_diff
        .iter()
        .map(|d| {
            vec![
                d.package.clone(),
                format!("{}, {}", d.info1.version, human(d.info1.size)),
                format!("{}, {}", d.info2.version, human(d.info2.size)),
            ]
        })
        .collect();
    let header1 = format!("IMAGE1 ({})", image1);
    let header2 = format!("IMAGE2 ({})", image2);
    table(out, &["PACKAGE", &header1, &header2], &rows)
}

fn history(out: &mut String, items: &[HistoryItem]) -> std::fmt::Result {
    if items.is_empty() {
        return writeln!(out, "None");
    }
    for item in items {
        writeln!(out, "- {}", item.created_by)?;
    }
    Ok(())
}

fn history_diff(
    out: &mut String,
    image1: &str,
    image2: &str,
    diff: &HistoryDiff,
) -> std::fmt::Result {
    for (label, lines) in [(image1, &diff.dels), (image2, &diff.adds)] {
        writeln!(out, "Docker history lines found only in {}:", label)?;
        if lines.is_empty() {
            writeln!(out, "None")?;
        }
        for line in lines {
            writeln!(out, "- {}", line)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::{AnalyzeResult, DiffResult, InfoDiff, PackageInfo};

    fn package_diff_result() -> AnalysisResult {
        AnalysisResult::PackageDiff(DiffResult {
            image1: "a".to_string(),
            image2: "b".to_string(),
            diff_type: "Apt".to_string(),
            diff: PackageDiff {
                packages1: Vec::new(),
                packages2: vec![PackageEntry {
                    name: "curl".to_string(),
                    version: "7.88".to_string(),
                    size: 2048,
                }],
                info_diff: vec![InfoDiff {
                    package: "foo".to_string(),
                    info1: PackageInfo::new("1.0", 1024),
                    info2: PackageInfo::new("2.0", 1024),
                }],
            },
        })
    }

    fn history_result(image: &str) -> AnalysisResult {
        AnalysisResult::HistoryAnalysis(AnalyzeResult {
            image: image.to_string(),
            analyze_type: "History".to_string(),
            analysis: vec![HistoryItem::new("/bin/sh -c echo hi")],
        })
    }

    #[test]
    fn test_order_is_by_analyzer_name() {
        let mut late_first = ResultSet::new();
        late_first.insert("history", Ok(history_result("img")));
        late_first.insert("apt", Ok(package_diff_result()));

        let mut early_first = ResultSet::new();
        early_first.insert("apt", Ok(package_diff_result()));
        early_first.insert("history", Ok(history_result("img")));

        let json = late_first.render_structured().unwrap();
        assert_eq!(json, early_first.render_structured().unwrap());
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["DiffType"], "Apt");
        assert_eq!(parsed[1]["AnalyzeType"], "History");

        let text = late_first.render_text();
        let apt = text.find("-----Apt-----").unwrap();
        let history = text.find("-----History-----").unwrap();
        assert!(apt < history);
    }

    #[test]
    fn test_failed_analyzer_is_isolated() {
        let mut results = ResultSet::new();
        results.insert(
            "apt",
            Err(Error::UnsupportedAnalyzer {
                analyzer: "apt".to_string(),
                image: "alpine".to_string(),
                reason: "no dpkg database".to_string(),
            }),
        );
        results.insert("history", Ok(history_result("alpine")));

        let parsed: serde_json::Value =
            serde_json::from_str(&results.render_structured().unwrap()).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
        assert_eq!(parsed[0]["AnalyzeType"], "History");

        let text = results.render_text();
        assert!(text.contains("-----Apt-----"));
        assert!(text.contains("no dpkg database"));
        assert!(text.contains("Error: analyzer 'apt' cannot run against image 'alpine'"));
        assert!(!text.contains("failed to render"));
        assert!(text.contains("- /bin/sh -c echo hi"));
        assert_eq!(results.failures().count(), 1);
    }

    #[test]
    fn test_package_diff_text() {
        let text = package_diff_result().render_text("apt").unwrap();
        assert!(text.contains("Packages found only in a:\nNone"));
        assert!(text.contains("curl"));
        assert!(text.contains("2.00 KiB"));
        assert!(text.contains("1.0, 1.00 KiB"));
        assert!(text.contains("2.0, 1.00 KiB"));
    }

    #[test]
    fn test_structured_output_is_stable() {
        let mut results = ResultSet::new();
        results.insert("apt", Ok(package_diff_result()));
        assert_eq!(
            results.render_structured().unwrap(),
            results.render_structured().unwrap()
        );
        assert!(results.render_structured().unwrap().starts_with("[\n  {"));
    }
}
