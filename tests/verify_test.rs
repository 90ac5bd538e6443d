//! Tests for archive verification against the sidecar manifest.

use std::path::Path;

use chrono::{TimeZone, Utc};

use cobblemon_agent::backup::{create_backup_sync, BackupManifest, BackupResult};
use cobblemon_agent::config::BackupConfig;
use cobblemon_agent::verify::{verify, verify_backup, VerifyIssue};

fn make_backup(root: &Path) -> BackupResult {
    let world = root.join("world");
    std::fs::create_dir_all(world.join("playerdata")).expect("mkdir playerdata");
    std::fs::write(world.join("level.dat"), b"level data").expect("write level.dat");
    std::fs::write(
        world.join("playerdata").join("steve.dat"),
        b"party: pikachu, bulbasaur",
    )
    .expect("write player data");

    let config = BackupConfig {
        sources: vec![world],
        backups_dir: root.join("backups"),
        ..BackupConfig::default()
    };
    let now = Utc
        .with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
        .single()
        .expect("valid time");
    create_backup_sync(&config, now).expect("create backup")
}

fn rewrite_manifest(path: &Path, edit: impl FnOnce(&mut BackupManifest)) {
    let mut manifest = BackupManifest::load(path).expect("load manifest");
    edit(&mut manifest);
    manifest.write(path).expect("write manifest");
}

#[test]
fn fresh_backup_verifies_clean() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert!(report.is_ok(), "issues: {}", report.summary());
    assert_eq!(report.summary(), "ok");
    assert_eq!(report.files_checked, 2);
    assert_eq!(report.bytes_checked, 10 + 25);
    assert_eq!(report.archive, backup.archive_path);
}

#[tokio::test]
async fn async_verify_matches_sync() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());

    let report = verify(&backup.archive_path).await.expect("verify");
    assert!(report.is_ok());
    assert_eq!(report.files_checked, 2);
}

#[test]
fn corrupted_archive_is_detected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());

    let mut bytes = std::fs::read(&backup.archive_path).expect("read archive");
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    std::fs::write(&backup.archive_path, &bytes).expect("write archive");

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert!(!report.is_ok());
    assert!(report
        .issues
        .iter()
        .any(|i| matches!(i, VerifyIssue::ArchiveChecksumMismatch { .. })));
}

#[test]
fn truncated_archive_is_detected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());

    let bytes = std::fs::read(&backup.archive_path).expect("read archive");
    std::fs::write(&backup.archive_path, &bytes[..bytes.len() / 2]).expect("truncate");

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert!(report
        .issues
        .iter()
        .any(|i| matches!(i, VerifyIssue::ArchiveSizeMismatch { .. })));
    assert!(report
        .issues
        .iter()
        .any(|i| matches!(i, VerifyIssue::ArchiveUnreadable(_))));
    // A partial read does not produce missing-entry noise.
    assert!(!report
        .issues
        .iter()
        .any(|i| matches!(i, VerifyIssue::MissingEntry { .. })));
}

#[test]
fn entry_checksum_mismatch_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());
    rewrite_manifest(&backup.manifest_path, |m| {
        m.files[0].sha256 = "00".repeat(32);
    });

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert_eq!(report.issues.len(), 1, "issues: {}", report.summary());
    match &report.issues[0] {
        VerifyIssue::EntryChecksumMismatch { path, expected, .. } => {
            assert_eq!(path, "world/level.dat");
            assert_eq!(expected, &"00".repeat(32));
        }
        other => panic!("unexpected issue: {other}"),
    }
}

#[test]
fn entry_size_mismatch_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());
    rewrite_manifest(&backup.manifest_path, |m| {
        m.files[0].size = 999;
    });

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert_eq!(
        report.issues,
        vec![VerifyIssue::EntrySizeMismatch {
            path: "world/level.dat".to_owned(),
            expected: 999,
            actual: 10,
        }]
    );
}

#[test]
fn entry_missing_from_manifest_is_unexpected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());
    rewrite_manifest(&backup.manifest_path, |m| {
        m.files.retain(|e| e.path != "world/playerdata/steve.dat");
    });

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert_eq!(
        report.issues,
        vec![VerifyIssue::UnexpectedEntry {
            path: "world/playerdata/steve.dat".to_owned(),
        }]
    );
}

#[test]
fn manifest_entry_absent_from_archive_is_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());
    rewrite_manifest(&backup.manifest_path, |m| {
        let mut ghost = m.files[0].clone();
        ghost.path = "world/ghost.dat".to_owned();
        m.files.push(ghost);
    });

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert_eq!(
        report.issues,
        vec![VerifyIssue::MissingEntry {
            path: "world/ghost.dat".to_owned(),
        }]
    );
}

#[test]
fn missing_manifest_is_reported_but_archive_still_decoded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());
    std::fs::remove_file(&backup.manifest_path).expect("remove manifest");

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert_eq!(
        report.issues,
        vec![VerifyIssue::ManifestMissing(backup.manifest_path.clone())]
    );
    assert_eq!(report.files_checked, 2);
}

#[test]
fn unparseable_manifest_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());
    std::fs::write(&backup.manifest_path, "{ not json").expect("corrupt manifest");

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert_eq!(report.issues.len(), 1);
    assert!(matches!(
        report.issues[0],
        VerifyIssue::ManifestUnreadable(_)
    ));
}

#[test]
fn unsupported_manifest_version_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());
    rewrite_manifest(&backup.manifest_path, |m| m.version = 99);

    let report = verify_backup(&backup.archive_path).expect("verify");
    assert!(report
        .issues
        .iter()
        .any(|i| matches!(i, VerifyIssue::ManifestUnreadable(msg) if msg.contains("99"))));
}

#[test]
fn summary_joins_issues() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backup = make_backup(dir.path());
    rewrite_manifest(&backup.manifest_path, |m| {
        m.files[0].size = 1;
        m.files[0].sha256 = "ab".repeat(32);
    });

    let report = verify_backup(&backup.archive_path).expect("verify");
    let summary = report.summary();
    assert!(summary.contains("size mismatch"));
    assert!(summary.contains("; "));
    assert!(summary.contains("checksum mismatch"));
}

#[test]
fn nonexistent_archive_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(verify_backup(&dir.path().join("missing.tar.gz")).is_err());
}
