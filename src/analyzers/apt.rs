use std::fs;

use super::package::{PackageInfo, PackageManager, PackageMap};
use crate::error::{Error, Result};
use crate::image::Image;

const STATUS_FILE: &str = "var/lib/dpkg/status";

/// Debian packages recorded in the dpkg status database.
pub struct Apt;

impl PackageManager for Apt {
    fn name(&self) -> &'static str {
        "apt"
    }

    fn packages(&self, image: &Image) -> Result<PackageMap> {
        let path = image.root().join(STATUS_FILE);
        let content = fs::read_to_string(&path).map_err(|e| Error::UnsupportedAnalyzer {
            analyzer: self.name().to_string(),
            image: image.source().to_string(),
            reason: format!("cannot read /{}: {}", STATUS_FILE, e),
        })?;
        Ok(parse_status(&content))
    }
}

#[derive(Default)]
struct Stanza {
    package: Option<String>,
    version: Option<String>,
    installed_kib: u64,
    status: Option<String>,
}

impl Stanza {
    fn into_entry(self) -> Option<(String, PackageInfo)> {
        let installed = self
            .status
            .as_deref()
            .map_or(true, |s| s.split_whitespace().last() == Some("installed"));
        if !installed {
            return None;
        }
        Some((
            self.package?,
            PackageInfo::new(self.version?, self.installed_kib * 1024),
        ))
    }
}

/// Parses a dpkg status file. Stanzas are separated by blank lines;
/// continuation lines are skipped.
fn parse_status(content: &str) -> PackageMap {
    let mut packages = PackageMap::new();
    let mut stanza = Stanza::default();

    for line in content.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let Some((name, info)) = std::mem::take(&mut stanza).into_entry() {
                packages.insert(name, info);
            }
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Package" => stanza.package = Some(value.to_string()),
            "Version" => stanza.version = Some(value.to_string()),
            "Installed-Size" => stanza.installed_kib = value.parse().unwrap_or(0),
            "Status" => stanza.status = Some(value.to_string()),
            _ => {}
        }
    }
    packages
}
