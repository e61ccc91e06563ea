//! Layer pipeline runs over staged save archives.

mod common;

use imagediff::cancel::CancelSignal;
use imagediff::layers::LayerPipeline;
use imagediff::save_archive::SaveArchive;
use imagediff::Error;
use std::fs;
use tempfile::TempDir;

fn staged_archive(dir: &TempDir) -> SaveArchive {
    let path = dir.path().join("image.tar");
    common::write_save_archive(
        &path,
        &common::config(&["base", "update"]),
        &[
            common::gzip(&common::layer(&[
                ("etc/version", b"1"),
                ("opt/tool/bin", b"tool"),
                ("opt/tool/cache", b"stale"),
            ])),
            common::layer(&[("etc/version", b"2"), ("opt/tool/.wh.cache", b"")]),
        ],
    );
    SaveArchive::stage(&path).expect("stage archive")
}

#[tokio::test]
async fn test_layers_apply_in_manifest_order() {
    let dir = TempDir::new().unwrap();
    let archive = staged_archive(&dir);
    let layers = archive.layers();
    assert_eq!(layers.len(), 2);
    assert!(layers.iter().all(|l| l.digest.starts_with("sha256:")));

    let dest = TempDir::new().unwrap();
    LayerPipeline::new(archive.fetcher(), CancelSignal::new())
        .materialize(&layers, dest.path())
        .await
        .unwrap();

    assert_eq!(fs::read(dest.path().join("etc/version")).unwrap(), b"2");
    assert_eq!(fs::read(dest.path().join("opt/tool/bin")).unwrap(), b"tool");
    assert!(!dest.path().join("opt/tool/cache").exists());
}

#[tokio::test]
async fn test_cancelled_pipeline_applies_nothing() {
    let dir = TempDir::new().unwrap();
    let archive = staged_archive(&dir);
    let layers = archive.layers();
    let cancel = CancelSignal::new();
    cancel.cancel();

    let dest = TempDir::new().unwrap();
    let err = LayerPipeline::new(archive.fetcher(), cancel)
        .materialize(&layers, dest.path())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(!dest.path().join("etc/version").exists());
}
