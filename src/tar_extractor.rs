//! Applies one uncompressed layer tar stream onto a destination tree.
//!
//! Overlay conventions from the OCI layer format are honoured:
//! - `.wh.<name>` deletes `<name>` from the already-materialized tree.
//! - `.wh..wh..opq` clears everything lower layers put in its directory.
//!
//! Links are recreated as links, modes and mtimes come from the tar headers,
//! and any entry that would land outside the destination is rejected.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

use crate::compression;
use crate::error::{Error, Result};

const OPAQUE_MARKER: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// Normalizes a path from a tar archive relative to the destination root.
/// Absolute paths are re-rooted; `..` is refused.
fn normalize_tar_path(p: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::archive(format!(
                    "entry escapes destination root: {}",
                    p.display()
                )));
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }

    Ok(out)
}

/// True when some directory between `root` and `rel` is a symlink, i.e. the
/// path would be resolved through a link rather than inside the tree.
fn has_symlink_ancestor(root: &Path, rel: &Path) -> bool {
    let mut current = root.to_path_buf();
    if let Some(parent) = rel.parent() {
        for comp in parent.components() {
            current.push(comp);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    }
    false
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes whatever lower layers left at `target` when it would conflict with
/// the incoming entry: a non-directory is always replaced, a directory only
/// when the incoming entry is not one.
fn clear_conflicting_entry(target: &Path, incoming_is_dir: bool) -> std::io::Result<()> {
    let Ok(meta) = fs::symlink_metadata(target) else {
        return Ok(());
    };
    if meta.is_dir() {
        if !incoming_is_dir {
            log::debug!("Replacing directory with file: {}", target.display());
            fs::remove_dir_all(target)?;
        }
    } else {
        fs::remove_file(target)?;
    }
    Ok(())
}

fn clear_opaque_dir(root: &Path, rel_dir: &Path, written: &HashSet<PathBuf>) -> Result<()> {
    let opaque_dir = root.join(rel_dir);
    if has_symlink_ancestor(root, &rel_dir.join(OPAQUE_MARKER)) || !opaque_dir.is_dir() {
        return Ok(());
    }
    log::debug!(
        "Found opaque directory marker, clearing: {}",
        opaque_dir.display()
    );
    clear_lower_entries(root, rel_dir, written)
}

/// Removes everything under `rel_dir` this layer did not write, descending
/// into directories it did.
fn clear_lower_entries(root: &Path, rel_dir: &Path, written: &HashSet<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(root.join(rel_dir))? {
        let entry = entry?;
        let rel_child = rel_dir.join(entry.file_name());
        if !written.contains(&rel_child) {
            remove_path(&entry.path())?;
        } else if entry.file_type()?.is_dir() {
            clear_lower_entries(root, &rel_child, written)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn ensure_owner_access(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(dir) {
        let mode = meta.permissions().mode();
        if mode & 0o700 != 0o700 {
            // Owner keeps rwx so later layers can write beneath it.
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o700));
        }
    }
}

#[cfg(not(unix))]
fn ensure_owner_access(_dir: &Path) {}

/// Materializes every entry of an uncompressed tar stream into `dest`.
pub fn unpack_layer<R: Read>(reader: R, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    let mut written: HashSet<PathBuf> = HashSet::new();

    let entries = archive
        .entries()
        .map_err(|e| Error::archive(format!("failed to read archive: {}", e)))?;

    for entry_result in entries {
        let mut entry =
            entry_result.map_err(|e| Error::archive(format!("malformed tar header: {}", e)))?;
        let entry_type = entry.header().entry_type();

        let raw_path = entry
            .path()
            .map_err(|e| Error::archive(format!("invalid entry path: {}", e)))?
            .into_owned();
        let rel_path = normalize_tar_path(&raw_path)?;
        if rel_path.as_os_str().is_empty() {
            continue;
        }

        let file_name = rel_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let parent = rel_path.parent().unwrap_or_else(|| Path::new(""));

        if file_name == OPAQUE_MARKER {
            clear_opaque_dir(dest, parent, &written)?;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let hidden_rel = parent.join(hidden);
            if has_symlink_ancestor(dest, &hidden_rel) {
                log::warn!(
                    "Ignoring whiteout through symlinked directory: {}",
                    hidden_rel.display()
                );
            } else {
                log::debug!("Found whiteout marker, deleting: {}", hidden_rel.display());
                remove_path(&dest.join(&hidden_rel))?;
            }
            continue;
        }

        match entry_type {
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                log::debug!(
                    "Skipping device entry {:?}: {}",
                    entry_type,
                    rel_path.display()
                );
                continue;
            }
            _ => {}
        }

        let target = dest.join(&rel_path);
        if !has_symlink_ancestor(dest, &rel_path) {
            clear_conflicting_entry(&target, entry_type.is_dir())?;
        }

        match entry.unpack_in(dest) {
            Ok(true) => {}
            Ok(false) => {
                return Err(Error::archive(format!(
                    "entry escapes destination root: {}",
                    raw_path.display()
                )));
            }
            Err(e) if entry_type.is_hard_link() => {
                log::warn!(
                    "Skipping broken hardlink {}: {}",
                    rel_path.display(),
                    e
                );
                continue;
            }
            Err(e) => {
                return Err(Error::archive(format!(
                    "failed to unpack {}: {}",
                    rel_path.display(),
                    e
                )));
            }
        }

        if entry_type.is_dir() {
            ensure_owner_access(&target);
        }
        // Parents count as written too, so an opaque clear keeps the path.
        for ancestor in rel_path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() || !written.insert(ancestor.to_path_buf()) {
                break;
            }
        }
        written.insert(rel_path);
    }

    Ok(())
}

/// Applies a layer stored on disk, detecting its compression first.
pub fn unpack_layer_file(path: &Path, dest: &Path, digest: &str) -> Result<()> {
    let file = File::open(path).map_err(|e| Error::LayerFetch {
        digest: digest.to_string(),
        reason: format!("failed to open {}: {}", path.display(), e),
    })?;
    let reader = compression::decoded_reader(file).map_err(|reason| Error::Decompression {
        digest: digest.to_string(),
        reason,
    })?;
    unpack_layer(reader, dest).map_err(|e| e.with_layer(digest))
}
