use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use super::disk_usage;
use super::package::{PackageInfo, PackageManager, PackageMap};
use crate::error::Result;
use crate::image::Image;

const LIB_DIRS: [&str; 2] = ["usr/lib", "usr/local/lib"];
const PACKAGE_DIRS: [&str; 2] = ["site-packages", "dist-packages"];

/// Python distributions installed under site/dist-packages or `PYTHONPATH`.
pub struct Pip;

impl PackageManager for Pip {
    fn name(&self) -> &'static str {
        "pip"
    }

    fn packages(&self, image: &Image) -> Result<PackageMap> {
        let mut packages = PackageMap::new();
        for dir in package_dirs(image) {
            log::debug!("Scanning {} for python packages", dir.display());
            for (name, info) in scan_dir(&dir)? {
                packages.entry(name).or_insert(info);
            }
        }
        Ok(packages)
    }
}

/// Candidate package directories inside the image root, sorted and deduplicated.
/// Nothing reached through a symlink is scanned: an absolute link target
/// would resolve against the host, not the image.
fn package_dirs(image: &Image) -> BTreeSet<PathBuf> {
    let root = image.root();
    let mut dirs = BTreeSet::new();

    for lib in LIB_DIRS {
        let Some(lib_dir) = within_root(root, lib) else {
            continue;
        };
        let Ok(entries) = fs::read_dir(lib_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || !entry.file_name().to_string_lossy().starts_with("python") {
                continue;
            }
            for packages in PACKAGE_DIRS {
                let candidate = entry.path().join(packages);
                if is_real_dir(&candidate) {
                    dirs.insert(candidate);
                }
            }
        }
    }

    if let Some(python_path) = image.config().env_var("PYTHONPATH") {
        for entry in python_path.split(':').filter(|p| !p.is_empty()) {
            if let Some(candidate) = within_root(root, entry) {
                if is_real_dir(&candidate) {
                    dirs.insert(candidate);
                }
            }
        }
    }
    dirs
}

/// Joins an absolute in-image path onto `root`. Refuses `..` components and
/// paths that pass through a symlink.
fn within_root(root: &Path, in_image: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(in_image).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => return None,
        }
        if fs::symlink_metadata(&path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            log::debug!("Not following symlink {}", path.display());
            return None;
        }
    }
    Some(path)
}

/// A directory that is not itself a symlink.
fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace('_', "-")
}

fn scan_dir(dir: &Path) -> Result<Vec<(String, PackageInfo)>> {
    let mut found = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(dir)?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if entry.file_type().map(|t| t.is_symlink()).unwrap_or(true) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = file_name
            .strip_suffix(".dist-info")
            .or_else(|| file_name.strip_suffix(".egg-info"))
        else {
            continue;
        };

        let metadata_dir = entry.path();
        let (name, version) = read_metadata(&metadata_dir)
            .or_else(|| stem.split_once('-').map(|(n, v)| (n.to_string(), v.to_string())))
            .unwrap_or_else(|| (stem.to_string(), String::new()));

        let size = installed_size(dir, &name, &metadata_dir);
        found.push((normalize_name(&name), PackageInfo::new(version, size)));
    }
    Ok(found)
}

/// Reads `Name` and `Version` from the METADATA or PKG-INFO headers.
fn read_metadata(metadata_dir: &Path) -> Option<(String, String)> {
    let content = ["METADATA", "PKG-INFO"]
        .iter()
        .find_map(|f| fs::read_to_string(metadata_dir.join(f)).ok())
        .or_else(|| fs::read_to_string(metadata_dir).ok())?;

    let mut name = None;
    let mut version = None;
    for line in content.lines() {
        if line.trim().is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Name:") {
            name = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("Version:") {
            version = Some(v.trim().to_string());
        }
    }
    Some((name?, version?))
}

/// Size of the package's import directory or module, falling back to its
/// metadata directory.
fn installed_size(dir: &Path, name: &str, metadata_dir: &Path) -> u64 {
    let module = name.replace('-', "_");
    for candidate in [name.to_string(), module.clone(), module.to_lowercase()] {
        let package_dir = dir.join(&candidate);
        if is_real_dir(&package_dir) {
            return disk_usage(&package_dir);
        }
        match fs::symlink_metadata(dir.join(format!("{}.py", candidate))) {
            Ok(meta) if meta.is_file() => return meta.len(),
            _ => {}
        }
    }
    disk_usage(metadata_dir)
}
