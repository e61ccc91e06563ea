use serde::Serialize;

use super::{display_name, AnalysisResult, Analyzer, AnalyzeResult, DiffResult};
use crate::config::Options;
use crate::error::Result;
use crate::image::Image;

/// Compares build histories as ordered sequences of commands.
pub struct HistoryAnalyzer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Op {
    #[serde(rename = "=")]
    Same,
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Del,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryStep {
    #[serde(rename = "Op")]
    pub op: Op,
    #[serde(rename = "CreatedBy")]
    pub created_by: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryDiff {
    #[serde(rename = "Adds")]
    pub adds: Vec<String>,
    #[serde(rename = "Dels")]
    pub dels: Vec<String>,
    /// Both histories merged in order.
    #[serde(rename = "Sequence")]
    pub sequence: Vec<HistoryStep>,
}

/// Longest-common-subsequence alignment of two command lists. Where the
/// sequences diverge, deletions come before additions.
pub fn align(a: &[String], b: &[String]) -> Vec<HistoryStep> {
    let (n, m) = (a.len(), b.len());
    // lcs[i][j] is the LCS length of a[i..] and b[j..].
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let step = |op, created_by: &String| HistoryStep {
        op,
        created_by: created_by.clone(),
    };
    let mut steps = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            steps.push(step(Op::Same, &a[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            steps.push(step(Op::Del, &a[i]));
            i += 1;
        } else {
            steps.push(step(Op::Add, &b[j]));
            j += 1;
        }
    }
    steps.extend(a[i..].iter().map(|c| step(Op::Del, c)));
    steps.extend(b[j..].iter().map(|c| step(Op::Add, c)));
    steps
}

fn commands(image: &Image) -> Vec<String> {
    image
        .config()
        .history
        .iter()
        .map(|h| h.created_by.clone())
        .collect()
}

impl Analyzer for HistoryAnalyzer {
    fn name(&self) -> &'static str {
        "history"
    }

    fn diff(&self, image1: &Image, image2: &Image, _options: &Options) -> Result<AnalysisResult> {
        let sequence = align(&commands(image1), &commands(image2));
        let pick = |wanted: Op| -> Vec<String> {
            sequence
                .iter()
                .filter(|s| s.op == wanted)
                .map(|s| s.created_by.clone())
                .collect()
        };

        Ok(AnalysisResult::HistoryDiff(DiffResult {
            image1: image1.source().to_string(),
            image2: image2.source().to_string(),
            diff_type: display_name(self.name()),
            diff: HistoryDiff {
                adds: pick(Op::Add),
                dels: pick(Op::Del),
                sequence,
            },
        }))
    }

    /// History keeps build order regardless of sorting options.
    fn analyze(&self, image: &Image, _options: &Options) -> Result<AnalysisResult> {
        Ok(AnalysisResult::HistoryAnalysis(AnalyzeResult {
            image: image.source().to_string(),
            analyze_type: display_name(self.name()),
            analysis: image.config().history.clone(),
        }))
    }
}
