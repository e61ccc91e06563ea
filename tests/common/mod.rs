//! Common utilities for integration tests
//!
//! Builds `docker save` style archives on the fly so no daemon or registry
//! is needed.

#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tar_rs as tar;

pub const DPKG_STATUS: &[u8] = b"Package: base-files\n\
Status: install ok installed\n\
Installed-Size: 400\n\
Version: 12.4\n\
\n\
Package: libc6\n\
Status: install ok installed\n\
Installed-Size: 12000\n\
Version: 2.36-9\n";

/// Image config with the given build steps.
pub fn config(history: &[&str]) -> String {
    let history: Vec<serde_json::Value> = history
        .iter()
        .map(|step| serde_json::json!({ "created_by": step }))
        .collect();
    serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": { "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin"] },
        "rootfs": { "type": "layers", "diff_ids": [] },
        "history": history,
    })
    .to_string()
}

/// Uncompressed layer tar holding the given files.
pub fn layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, path, *data)
            .expect("append layer entry");
    }
    builder.into_inner().expect("finish layer")
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).expect("gzip layer");
    encoder.finish().expect("finish gzip")
}

fn append_blob(builder: &mut tar::Builder<File>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, path, data)
        .expect("append archive member");
}

/// Writes a save archive whose layers are stored under `blobs/sha256/`.
pub fn write_save_archive(path: &Path, config: &str, layers: &[Vec<u8>]) {
    let mut builder = tar::Builder::new(File::create(path).expect("create archive"));

    let config_digest = hex::encode(Sha256::digest(config.as_bytes()));
    let config_path = format!("blobs/sha256/{}", config_digest);
    append_blob(&mut builder, &config_path, config.as_bytes());

    let mut layer_paths = Vec::new();
    for blob in layers {
        let layer_path = format!("blobs/sha256/{}", hex::encode(Sha256::digest(blob)));
        append_blob(&mut builder, &layer_path, blob);
        layer_paths.push(layer_path);
    }

    let manifest = serde_json::json!([{
        "Config": config_path,
        "RepoTags": ["fixture:latest"],
        "Layers": layer_paths,
    }]);
    append_blob(&mut builder, "manifest.json", manifest.to_string().as_bytes());
    builder.finish().expect("finish archive");
}
