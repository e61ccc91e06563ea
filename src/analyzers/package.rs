//! Shared diffing for package managers.
//!
//! Each manager only has to turn an image into a [`PackageMap`];
//! [`PackageAnalyzer`] does the rest.

use serde::Serialize;
use std::collections::BTreeMap;

use super::{display_name, sort_entries, AnalysisResult, Analyzer, AnalyzeResult, DiffResult};
use crate::config::Options;
use crate::error::Result;
use crate::image::Image;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

impl PackageInfo {
    pub fn new(version: impl Into<String>, size: u64) -> Self {
        Self {
            version: version.into(),
            size,
        }
    }
}

pub type PackageMap = BTreeMap<String, PackageInfo>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

/// A package present in both images with a different version or size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoDiff {
    #[serde(rename = "Package")]
    pub package: String,
    #[serde(rename = "Info1")]
    pub info1: PackageInfo,
    #[serde(rename = "Info2")]
    pub info2: PackageInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageDiff {
    /// Only in the first image.
    #[serde(rename = "Packages1")]
    pub packages1: Vec<PackageEntry>,
    /// Only in the second image.
    #[serde(rename = "Packages2")]
    pub packages2: Vec<PackageEntry>,
    #[serde(rename = "InfoDiff")]
    pub info_diff: Vec<InfoDiff>,
}

impl PackageDiff {
    pub fn is_empty(&self) -> bool {
        self.packages1.is_empty() && self.packages2.is_empty() && self.info_diff.is_empty()
    }
}

pub trait PackageManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reads every installed package in `image`.
    fn packages(&self, image: &Image) -> Result<PackageMap>;
}

fn entry(name: &str, info: &PackageInfo) -> PackageEntry {
    PackageEntry {
        name: name.to_string(),
        version: info.version.clone(),
        size: info.size,
    }
}

pub(crate) fn list_packages(packages: &PackageMap, options: &Options) -> Vec<PackageEntry> {
    let mut entries: Vec<PackageEntry> = packages.iter().map(|(n, i)| entry(n, i)).collect();
    sort_entries(&mut entries, options, |e| (e.name.as_str(), e.size));
    entries
}

pub(crate) fn diff_packages(
    packages1: &PackageMap,
    packages2: &PackageMap,
    options: &Options,
) -> PackageDiff {
    let mut diff = PackageDiff::default();

    for (name, info1) in packages1 {
        match packages2.get(name) {
            None => diff.packages1.push(entry(name, info1)),
            Some(info2) if info2 != info1 => diff.info_diff.push(InfoDiff {
                package: name.clone(),
                info1: info1.clone(),
                info2: info2.clone(),
            }),
            Some(_) => {}
        }
    }
    for (name, info2) in packages2 {
        if !packages1.contains_key(name) {
            diff.packages2.push(entry(name, info2));
        }
    }

    sort_entries(&mut diff.packages1, options, |e| (e.name.as_str(), e.size));
    sort_entries(&mut diff.packages2, options, |e| (e.name.as_str(), e.size));
    sort_entries(&mut diff.info_diff, options, |d| {
        (d.package.as_str(), d.info1.size.max(d.info2.size))
    });
    diff
}

/// Adapts a [`PackageManager`] to the [`Analyzer`] contract.
pub struct PackageAnalyzer<M> {
    manager: M,
}

impl<M: PackageManager> PackageAnalyzer<M> {
    pub fn new(manager: M) -> Self {
        Self { manager }
    }
}

impl<M: PackageManager> Analyzer for PackageAnalyzer<M> {
    fn name(&self) -> &'static str {
        self.manager.name()
    }

    fn diff(&self, image1: &Image, image2: &Image, options: &Options) -> Result<AnalysisResult> {
        let packages1 = self.manager.packages(image1)?;
        let packages2 = self.manager.packages(image2)?;
        log::debug!(
            "{}: {} packages in {}, {} in {}",
            self.name(),
            packages1.len(),
            image1.source(),
            packages2.len(),
            image2.source()
        );

        Ok(AnalysisResult::PackageDiff(DiffResult {
            image1: image1.source().to_string(),
            image2: image2.source().to_string(),
            diff_type: display_name(self.name()),
            diff: diff_packages(&packages1, &packages2, options),
        }))
    }

    fn analyze(&self, image: &Image, options: &Options) -> Result<AnalysisResult> {
        let packages = self.manager.packages(image)?;
        Ok(AnalysisResult::PackageAnalysis(AnalyzeResult {
            image: image.source().to_string(),
            analyze_type: display_name(self.name()),
            analysis: list_packages(&packages, options),
        }))
    }
}
