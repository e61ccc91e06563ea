//! Filesystem tree comparison.
//!
//! Both trees are walked without following links. Every path is keyed by its
//! absolute in-image form (`/etc/hosts`). A path is modified when its kind
//! changes or, for anything but a directory, when its size or content
//! classification differs. Directories report the aggregate size of what
//! they contain but are never modified by content alone.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use walkdir::WalkDir;

use super::{display_name, sort_entries, AnalysisResult, Analyzer, AnalyzeResult, DiffResult};
use crate::config::Options;
use crate::error::Result;
use crate::image::Image;

pub struct FileAnalyzer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileModification {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Size1")]
    pub size1: u64,
    #[serde(rename = "Size2")]
    pub size2: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileDiff {
    #[serde(rename = "Adds")]
    pub adds: Vec<FileEntry>,
    #[serde(rename = "Dels")]
    pub dels: Vec<FileEntry>,
    #[serde(rename = "Mods")]
    pub mods: Vec<FileModification>,
}

impl FileDiff {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.dels.is_empty() && self.mods.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    File,
    Dir,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    kind: Kind,
    size: u64,
    /// Content hash for files, target for symlinks.
    classification: Option<String>,
}

impl Node {
    fn differs_from(&self, other: &Node) -> bool {
        if self.kind != other.kind {
            return true;
        }
        self.kind != Kind::Dir
            && (self.size != other.size || self.classification != other.classification)
    }
}

fn content_digest(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Unreadable files keep no classification and are compared by size alone.
fn readable_digest(key: &str, digest: io::Result<String>) -> io::Result<Option<String>> {
    match digest {
        Ok(digest) => Ok(Some(digest)),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            log::warn!("Cannot read {}, comparing by size only: {}", key, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Maps every path under `root` to its node.
fn snapshot(root: &Path) -> Result<BTreeMap<String, Node>> {
    let mut nodes = BTreeMap::new();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let key = format!("/{}", rel.to_string_lossy());
        let file_type = entry.file_type();

        let node = if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let target = target.to_string_lossy().to_string();
            Node {
                kind: Kind::Symlink,
                size: target.len() as u64,
                classification: Some(target),
            }
        } else if file_type.is_dir() {
            Node {
                kind: Kind::Dir,
                size: 0,
                classification: None,
            }
        } else if file_type.is_file() {
            Node {
                kind: Kind::File,
                size: entry.metadata().map_err(io::Error::from)?.len(),
                classification: readable_digest(&key, content_digest(entry.path()))?,
            }
        } else {
            Node {
                kind: Kind::Other,
                size: 0,
                classification: None,
            }
        };
        nodes.insert(key, node);
    }

    // Directories carry the total size of everything beneath them.
    let leaf_sizes: Vec<(String, u64)> = nodes
        .iter()
        .filter(|(_, n)| n.kind != Kind::Dir && n.size > 0)
        .map(|(k, n)| (k.clone(), n.size))
        .collect();
    for (path, size) in leaf_sizes {
        let mut current = path.as_str();
        while let Some(idx) = current.rfind('/') {
            current = &current[..idx];
            if current.is_empty() {
                break;
            }
            if let Some(dir) = nodes.get_mut(current) {
                dir.size += size;
            }
        }
    }
    Ok(nodes)
}

fn entries(nodes: &BTreeMap<String, Node>, options: &Options) -> Vec<FileEntry> {
    let mut list: Vec<FileEntry> = nodes
        .iter()
        .map(|(name, node)| FileEntry {
            name: name.clone(),
            size: node.size,
        })
        .collect();
    sort_entries(&mut list, options, |e| (e.name.as_str(), e.size));
    list
}

fn diff_trees(
    nodes1: &BTreeMap<String, Node>,
    nodes2: &BTreeMap<String, Node>,
    options: &Options,
) -> FileDiff {
    let mut diff = FileDiff::default();

    for (name, node1) in nodes1 {
        match nodes2.get(name) {
            None => diff.dels.push(FileEntry {
                name: name.clone(),
                size: node1.size,
            }),
            Some(node2) if node1.differs_from(node2) => diff.mods.push(FileModification {
                name: name.clone(),
                size1: node1.size,
                size2: node2.size,
            }),
            Some(_) => {}
        }
    }
    for (name, node2) in nodes2 {
        if !nodes1.contains_key(name) {
            diff.adds.push(FileEntry {
                name: name.clone(),
                size: node2.size,
            });
        }
    }

    sort_entries(&mut diff.adds, options, |e| (e.name.as_str(), e.size));
    sort_entries(&mut diff.dels, options, |e| (e.name.as_str(), e.size));
    sort_entries(&mut diff.mods, options, |m| {
        (m.name.as_str(), m.size1.max(m.size2))
    });
    diff
}

impl Analyzer for FileAnalyzer {
    fn name(&self) -> &'static str {
        "file"
    }

    fn diff(&self, image1: &Image, image2: &Image, options: &Options) -> Result<AnalysisResult> {
        let nodes1 = snapshot(image1.root())?;
        let nodes2 = snapshot(image2.root())?;
        log::debug!(
            "file: {} entries in {}, {} in {}",
            nodes1.len(),
            image1.source(),
            nodes2.len(),
            image2.source()
        );

        Ok(AnalysisResult::FileDiff(DiffResult {
            image1: image1.source().to_string(),
            image2: image2.source().to_string(),
            diff_type: display_name(self.name()),
            diff: diff_trees(&nodes1, &nodes2, options),
        }))
    }

    fn analyze(&self, image: &Image, options: &Options) -> Result<AnalysisResult> {
        let nodes = snapshot(image.root())?;
        Ok(AnalysisResult::FileAnalysis(AnalyzeResult {
            image: image.source().to_string(),
            analyze_type: display_name(self.name()),
            analysis: entries(&nodes, options),
        }))
    }
}
