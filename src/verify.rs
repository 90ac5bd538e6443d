//! Backup integrity checks.
//!
//! Verification re-hashes the archive, decodes every entry, and compares
//! both against the sidecar manifest. Problems are collected as
//! [`VerifyIssue`]s rather than returned as errors so that one run reports
//! everything wrong with an archive.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use flate2::read::GzDecoder;
use tracing::{info, warn};

use crate::backup::{self, BackupManifest, HashingWriter, MANIFEST_VERSION};

/// A problem found while verifying an archive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyIssue {
    /// No manifest next to the archive.
    #[error("manifest not found at {}", .0.display())]
    ManifestMissing(PathBuf),

    /// Manifest exists but cannot be used.
    #[error("manifest unreadable: {0}")]
    ManifestUnreadable(String),

    /// Archive bytes differ from what the manifest recorded.
    #[error("archive checksum mismatch: manifest {expected}, actual {actual}")]
    ArchiveChecksumMismatch {
        /// Digest from the manifest.
        expected: String,
        /// Digest of the file on disk.
        actual: String,
    },

    /// Archive size differs from what the manifest recorded.
    #[error("archive size mismatch: manifest {expected} bytes, actual {actual} bytes")]
    ArchiveSizeMismatch {
        /// Size from the manifest.
        expected: u64,
        /// Size of the file on disk.
        actual: u64,
    },

    /// The gzip or tar stream is corrupt.
    #[error("archive cannot be decoded: {0}")]
    ArchiveUnreadable(String),

    /// An entry's contents differ from the manifest.
    #[error("{path}: checksum mismatch (manifest {expected}, archive {actual})")]
    EntryChecksumMismatch {
        /// Entry path.
        path: String,
        /// Digest from the manifest.
        expected: String,
        /// Digest of the archived bytes.
        actual: String,
    },

    /// An entry's size differs from the manifest.
    #[error("{path}: size mismatch (manifest {expected} bytes, archive {actual} bytes)")]
    EntrySizeMismatch {
        /// Entry path.
        path: String,
        /// Size from the manifest.
        expected: u64,
        /// Size of the archived bytes.
        actual: u64,
    },

    /// The manifest lists a file the archive does not contain.
    #[error("{path}: listed in manifest but missing from archive")]
    MissingEntry {
        /// Entry path.
        path: String,
    },

    /// The archive contains a file the manifest does not list.
    #[error("{path}: present in archive but not in manifest")]
    UnexpectedEntry {
        /// Entry path.
        path: String,
    },
}

/// Result of verifying one archive.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// Archive that was verified.
    pub archive: PathBuf,
    /// Number of regular files decoded.
    pub files_checked: usize,
    /// Total bytes decoded from regular files.
    pub bytes_checked: u64,
    /// Problems found, empty when the archive is sound.
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    /// Whether no issues were found.
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    /// One-line description of the issues, or `"ok"`.
    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            return "ok".to_owned();
        }
        self.issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Verify an archive on the Tokio blocking pool.
///
/// # Errors
///
/// See [`verify_backup`].
pub async fn verify(archive: &Path) -> anyhow::Result<VerifyReport> {
    let archive = archive.to_owned();
    tokio::task::spawn_blocking(move || verify_backup(&archive))
        .await
        .context("verify task panicked")?
}

/// Verify an archive against its manifest.
///
/// Without a usable manifest the archive is still decoded end to end so
/// corruption is detected.
///
/// # Errors
///
/// Returns an error only if the archive itself cannot be opened or hashed.
pub fn verify_backup(archive: &Path) -> anyhow::Result<VerifyReport> {
    let meta = fs::metadata(archive)
        .with_context(|| format!("failed to stat archive {}", archive.display()))?;
    anyhow::ensure!(meta.is_file(), "{} is not a file", archive.display());

    let mut issues = Vec::new();

    // Step 1: Load the manifest.
    let manifest_path = backup::manifest_path(archive);
    let manifest = if manifest_path.exists() {
        match BackupManifest::load(&manifest_path) {
            Ok(m) if m.version == MANIFEST_VERSION => Some(m),
            Ok(m) => {
                issues.push(VerifyIssue::ManifestUnreadable(format!(
                    "unsupported manifest version {}",
                    m.version
                )));
                None
            }
            Err(e) => {
                issues.push(VerifyIssue::ManifestUnreadable(format!("{e:#}")));
                None
            }
        }
    } else {
        issues.push(VerifyIssue::ManifestMissing(manifest_path));
        None
    };

    // Step 2: Compare whole-archive checksum and size.
    let actual_sha = backup::sha256_file(archive)?;
    if let Some(m) = &manifest {
        if m.archive_sha256 != actual_sha {
            issues.push(VerifyIssue::ArchiveChecksumMismatch {
                expected: m.archive_sha256.clone(),
                actual: actual_sha,
            });
        }
        if m.archive_size != meta.len() {
            issues.push(VerifyIssue::ArchiveSizeMismatch {
                expected: m.archive_size,
                actual: meta.len(),
            });
        }
    }

    // Step 3: Decode every entry and compare against the manifest.
    let mut expected: HashMap<&str, &backup::ManifestEntry> = manifest
        .as_ref()
        .map(|m| m.files.iter().map(|e| (e.path.as_str(), e)).collect())
        .unwrap_or_default();

    let (files_checked, bytes_checked, decode_ok) =
        match decode_entries(archive, manifest.is_some(), &mut expected, &mut issues) {
            Ok((files, bytes)) => (files, bytes, true),
            Err((files, bytes, e)) => {
                issues.push(VerifyIssue::ArchiveUnreadable(e.to_string()));
                (files, bytes, false)
            }
        };

    // Missing entries are only meaningful if the whole stream was read.
    if decode_ok {
        let mut missing: Vec<&str> = expected.keys().copied().collect();
        missing.sort_unstable();
        issues.extend(missing.into_iter().map(|path| VerifyIssue::MissingEntry {
            path: path.to_owned(),
        }));
    }

    let report = VerifyReport {
        archive: archive.to_owned(),
        files_checked,
        bytes_checked,
        issues,
    };

    if report.is_ok() {
        info!(
            archive = %archive.display(),
            files = report.files_checked,
            bytes = report.bytes_checked,
            "backup verified"
        );
    } else {
        warn!(
            archive = %archive.display(),
            issues = report.issues.len(),
            summary = %report.summary(),
            "backup verification failed"
        );
    }

    Ok(report)
}

type DecodeError = (usize, u64, io::Error);

/// Stream the archive, hashing regular files and matching them off `expected`.
fn decode_entries(
    archive: &Path,
    have_manifest: bool,
    expected: &mut HashMap<&str, &backup::ManifestEntry>,
    issues: &mut Vec<VerifyIssue>,
) -> Result<(usize, u64), DecodeError> {
    let mut files = 0usize;
    let mut bytes = 0u64;

    let file = fs::File::open(archive).map_err(|e| (files, bytes, e))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    {
        let entries = tar.entries().map_err(|e| (files, bytes, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| (files, bytes, e))?;
            if entry.header().entry_type() != tar::EntryType::Regular {
                continue;
            }
            let path = entry
                .path()
                .map_err(|e| (files, bytes, e))?
                .to_string_lossy()
                .into_owned();

            let mut sink = HashingWriter::new();
            io::copy(&mut entry, &mut sink).map_err(|e| (files, bytes, e))?;
            let (sha, size) = sink.finish();

            files = files.saturating_add(1);
            bytes = bytes.saturating_add(size);

            if !have_manifest {
                continue;
            }
            match expected.remove(path.as_str()) {
                Some(want) => {
                    if want.size != size {
                        issues.push(VerifyIssue::EntrySizeMismatch {
                            path: path.clone(),
                            expected: want.size,
                            actual: size,
                        });
                    }
                    if want.sha256 != sha {
                        issues.push(VerifyIssue::EntryChecksumMismatch {
                            path,
                            expected: want.sha256.clone(),
                            actual: sha,
                        });
                    }
                }
                None => issues.push(VerifyIssue::UnexpectedEntry { path }),
            }
        }
    }

    // Read through the gzip trailer so its CRC is checked.
    let mut decoder = tar.into_inner();
    io::copy(&mut decoder, &mut io::sink()).map_err(|e| (files, bytes, e))?;

    Ok((files, bytes))
}
