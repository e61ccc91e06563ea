use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::disk_usage;
use super::package::{PackageInfo, PackageManager, PackageMap};
use crate::error::Result;
use crate::image::Image;

/// npm packages found in any `node_modules` directory of the image.
pub struct Node;

#[derive(Deserialize)]
struct PackageJson {
    name: Option<String>,
    version: Option<String>,
}

impl PackageManager for Node {
    fn name(&self) -> &'static str {
        "node"
    }

    fn packages(&self, image: &Image) -> Result<PackageMap> {
        let mut manifests: Vec<PathBuf> = WalkDir::new(image.root())
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == "package.json")
            .map(|entry| entry.into_path())
            .filter(|path| is_package_manifest(path))
            .collect();
        // Duplicate names keep the first path in lexicographic order.
        manifests.sort();

        let mut packages = PackageMap::new();
        for manifest in manifests {
            let Some((name, info)) = read_package(&manifest) else {
                continue;
            };
            packages.entry(name).or_insert(info);
        }
        Ok(packages)
    }
}

/// `node_modules/<name>/package.json` or `node_modules/@scope/<name>/package.json`.
fn is_package_manifest(path: &Path) -> bool {
    let Some(package_dir) = path.parent() else {
        return false;
    };
    let Some(parent) = package_dir.parent() else {
        return false;
    };
    if parent.file_name().is_some_and(|n| n == "node_modules") {
        return true;
    }
    let scoped = parent
        .file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('@'));
    scoped
        && parent
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|n| n == "node_modules")
}

fn read_package(manifest: &Path) -> Option<(String, PackageInfo)> {
    let package_dir = manifest.parent()?;
    let content = fs::read(manifest).ok()?;
    let parsed: PackageJson = match serde_json::from_slice(&content) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::debug!("Skipping {}: {}", manifest.display(), e);
            return None;
        }
    };

    let name = parsed.name.or_else(|| dir_package_name(package_dir))?;
    let version = parsed.version.unwrap_or_default();
    Some((name, PackageInfo::new(version, disk_usage(package_dir))))
}

fn dir_package_name(package_dir: &Path) -> Option<String> {
    let name = package_dir.file_name()?.to_string_lossy().to_string();
    let scope = package_dir
        .parent()
        .and_then(Path::file_name)
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| s.starts_with('@'));
    Some(match scope {
        Some(scope) => format!("{}/{}", scope, name),
        None => name,
    })
}
