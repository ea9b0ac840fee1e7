#[path = "../src/backup.rs"]
mod backup;

use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::ZipWriter;

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("quizd-backup-src");
    let workspace2 = temp_dir("quizd-backup-dst");
    let out_dir = temp_dir("quizd-backup-out");

    let db_src = workspace.join("quizd.sqlite3");
    let bytes = b"sqlite-test-payload";
    std::fs::write(&db_src, bytes).expect("write source db");

    let bundle_path = out_dir.join("workspace.quizd.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains(backup::BUNDLE_FORMAT_V1));
    assert!(manifest.contains(&export.db_sha256));
    archive
        .by_name("db/quizd.sqlite3")
        .expect("database entry in bundle");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);
    assert_eq!(import.db_sha256, export.db_sha256);

    let restored = std::fs::read(workspace2.join("quizd.sqlite3")).expect("read restored db");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn plain_file_is_not_a_bundle() {
    let out_dir = temp_dir("quizd-backup-notzip");
    let workspace = temp_dir("quizd-backup-notzip-dst");

    let fake = out_dir.join("fake.quizd.zip");
    std::fs::write(&fake, b"just some bytes").expect("write fake bundle");

    let err = backup::import_workspace_bundle(&fake, &workspace).expect_err("import must fail");
    assert!(
        err.to_string().contains("not a quizd bundle"),
        "unexpected error: {}",
        err
    );
    assert!(!workspace.join("quizd.sqlite3").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tampered_database_fails_the_digest_check() {
    let out_dir = temp_dir("quizd-backup-tamper");
    let workspace = temp_dir("quizd-backup-tamper-dst");

    // Hand-built bundle whose manifest digest does not match the payload.
    let bundle_path = out_dir.join("tampered.quizd.zip");
    let f = File::create(&bundle_path).expect("create bundle");
    let mut zip = ZipWriter::new(f);
    let opts: FileOptions = FileOptions::default();
    let manifest = json!({
        "format": backup::BUNDLE_FORMAT_V1,
        "version": 1,
        "dbSha256": "0000000000000000000000000000000000000000000000000000000000000000",
    });
    zip.start_file("manifest.json", opts).expect("start manifest");
    zip.write_all(manifest.to_string().as_bytes())
        .expect("write manifest");
    zip.start_file("db/quizd.sqlite3", opts).expect("start db entry");
    zip.write_all(b"swapped-in database bytes")
        .expect("write db entry");
    zip.finish().expect("finish bundle");

    let err =
        backup::import_workspace_bundle(&bundle_path, &workspace).expect_err("import must fail");
    assert!(
        err.to_string().contains("digest mismatch"),
        "unexpected error: {}",
        err
    );
    assert!(!workspace.join("quizd.sqlite3").exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
