//! Snapshot backups of server state as `.tar.gz` archives.
//!
//! Each archive is written to a `.partial` file and renamed once complete,
//! so a crash mid-backup never leaves a truncated archive with a final name.
//! Every file is read once and the same bytes are hashed and archived, which
//! keeps the manifest consistent with the archive even while the server is
//! writing to the world directory.

use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::db::{BackupRecord, StateDb};
use crate::verify::{self, VerifyReport};

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Archive file extension.
pub const ARCHIVE_EXT: &str = ".tar.gz";

/// Suffix appended to an archive path to form its manifest path.
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Suffix of in-progress archive files.
const PARTIAL_SUFFIX: &str = ".partial";

/// Timestamp embedded in archive names, UTC.
const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Length of a formatted [`STAMP_FORMAT`] timestamp.
const STAMP_LEN: usize = 15;

/// One archived file as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path inside the archive (`/`-separated, rooted at the source name).
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the file contents.
    pub sha256: String,
}

/// Sidecar manifest describing an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Manifest format version.
    pub version: u32,
    /// Creation time (RFC 3339, UTC).
    pub created_at: String,
    /// Archive file name.
    pub archive: String,
    /// Hex SHA-256 of the archive file.
    pub archive_sha256: String,
    /// Archive size in bytes.
    pub archive_size: u64,
    /// Sum of archived file sizes.
    pub total_bytes: u64,
    /// Archived files in archive order.
    pub files: Vec<ManifestEntry>,
}

impl BackupManifest {
    /// Read a manifest from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse manifest {}", path.display()))
    }

    /// Write the manifest atomically (temp file + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        let tmp = with_suffix(path, PARTIAL_SUFFIX);
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move manifest into {}", path.display()))?;
        Ok(())
    }
}

/// Result of a backup operation.
#[derive(Debug, Clone)]
pub struct BackupResult {
    /// Path of the finished archive.
    pub archive_path: PathBuf,
    /// Path of its manifest.
    pub manifest_path: PathBuf,
    /// The manifest that was written.
    pub manifest: BackupManifest,
    /// Configured sources that did not exist and were skipped.
    pub skipped_sources: Vec<PathBuf>,
}

/// Outcome of a full create, prune, verify cycle.
#[derive(Debug)]
pub struct BackupCycle {
    /// The archive that was created.
    pub backup: BackupResult,
    /// Archives removed by retention.
    pub pruned: Vec<PathBuf>,
    /// Verification report, if verification ran.
    pub report: Option<VerifyReport>,
}

/// Manifest path for an archive (`<archive>.manifest.json`).
pub fn manifest_path(archive: &Path) -> PathBuf {
    with_suffix(archive, MANIFEST_SUFFIX)
}

/// Create a snapshot archive of the configured sources.
///
/// Blocking I/O runs on the Tokio blocking pool.
///
/// # Errors
///
/// Returns an error if no source exists, the archive cannot be written, or
/// an archive with the same timestamp already exists.
pub async fn create_backup(
    config: &BackupConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<BackupResult> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || create_backup_sync(&config, now))
        .await
        .context("backup task panicked")?
}

/// Synchronous body of [`create_backup`].
///
/// # Errors
///
/// See [`create_backup`].
pub fn create_backup_sync(
    config: &BackupConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<BackupResult> {
    let excludes = config
        .exclude
        .iter()
        .map(|p| glob::Pattern::new(p).with_context(|| format!("invalid exclude glob '{p}'")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    // Step 1: Resolve sources and collect the file list.
    let mut files: Vec<PendingFile> = Vec::new();
    let mut dirs: Vec<(PathBuf, String)> = Vec::new();
    let mut skipped_sources = Vec::new();
    let mut roots: Vec<String> = Vec::new();

    for source in &config.sources {
        let meta = match fs::symlink_metadata(source) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(source = %source.display(), "backup source does not exist, skipping");
                skipped_sources.push(source.clone());
                continue;
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to stat backup source {}", source.display()))
            }
        };

        let root = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "backup source {} has no usable file name",
                    source.display()
                )
            })?;
        anyhow::ensure!(
            !roots.contains(&root),
            "two backup sources share the name '{root}'"
        );
        roots.push(root.clone());

        if meta.is_dir() {
            dirs.push((source.clone(), root.clone()));
            collect_dir(source, &root, &excludes, &mut files, &mut dirs)?;
        } else if meta.is_file() {
            files.push(PendingFile {
                source: source.clone(),
                archive_path: root,
            });
        } else {
            debug!(source = %source.display(), "backup source is not a file or directory, skipping");
            skipped_sources.push(source.clone());
        }
    }

    anyhow::ensure!(
        !roots.is_empty(),
        "none of the configured backup sources exist"
    );

    // Step 2: Write the archive under a temporary name.
    fs::create_dir_all(&config.backups_dir).with_context(|| {
        format!(
            "failed to create backups dir {}",
            config.backups_dir.display()
        )
    })?;

    let archive_name = format!(
        "{}-{}{ARCHIVE_EXT}",
        config.prefix,
        now.format(STAMP_FORMAT)
    );
    let archive_path = config.backups_dir.join(&archive_name);
    anyhow::ensure!(
        !archive_path.exists(),
        "backup archive {} already exists",
        archive_path.display()
    );
    let partial_path = with_suffix(&archive_path, PARTIAL_SUFFIX);

    info!(archive = %archive_path.display(), files = files.len(), "creating backup");

    let entries = match write_archive(&partial_path, &dirs, &files) {
        Ok(entries) => entries,
        Err(e) => {
            if let Err(rm) = fs::remove_file(&partial_path) {
                debug!(error = %rm, "failed to remove partial archive");
            }
            return Err(e);
        }
    };

    // Step 3: Hash the finished archive and move it into place.
    let archive_sha256 = sha256_file(&partial_path)?;
    let archive_size = fs::metadata(&partial_path)
        .with_context(|| format!("failed to stat {}", partial_path.display()))?
        .len();
    fs::rename(&partial_path, &archive_path)
        .with_context(|| format!("failed to move archive into {}", archive_path.display()))?;

    let total_bytes = entries.iter().fold(0u64, |acc, e| acc.saturating_add(e.size));
    let manifest = BackupManifest {
        version: MANIFEST_VERSION,
        created_at: now.to_rfc3339(),
        archive: archive_name,
        archive_sha256,
        archive_size,
        total_bytes,
        files: entries,
    };
    let manifest_path = manifest_path(&archive_path);
    manifest.write(&manifest_path)?;

    info!(
        archive = %archive_path.display(),
        files = manifest.files.len(),
        size_bytes = archive_size,
        "backup complete"
    );

    Ok(BackupResult {
        archive_path,
        manifest_path,
        manifest,
        skipped_sources,
    })
}

struct PendingFile {
    source: PathBuf,
    archive_path: String,
}

/// Walk a directory in sorted order, skipping symlinks and excluded names.
fn collect_dir(
    dir: &Path,
    prefix: &str,
    excludes: &[glob::Pattern],
    files: &mut Vec<PendingFile>,
    dirs: &mut Vec<(PathBuf, String)>,
) -> anyhow::Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read entries of {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if excludes.iter().any(|p| p.matches(&name)) {
            debug!(path = %entry.path().display(), "excluded from backup");
            continue;
        }

        let path = entry.path();
        let archive_path = format!("{prefix}/{name}");
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to get file type of {}", path.display()))?;

        if file_type.is_dir() {
            dirs.push((path.clone(), archive_path.clone()));
            collect_dir(&path, &archive_path, excludes, files, dirs)?;
        } else if file_type.is_file() {
            files.push(PendingFile {
                source: path,
                archive_path,
            });
        }
        // Skip symlinks and other special file types.
    }

    Ok(())
}

/// Write directories and files into a gzip-compressed tar at `path`.
fn write_archive(
    path: &Path,
    dirs: &[(PathBuf, String)],
    files: &[PendingFile],
) -> anyhow::Result<Vec<ManifestEntry>> {
    let file =
        fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (dir, name) in dirs {
        builder
            .append_dir(name, dir)
            .with_context(|| format!("failed to archive directory {}", dir.display()))?;
    }

    let mut entries = Vec::with_capacity(files.len());
    for pending in files {
        let bytes = match fs::read(&pending.source) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %pending.source.display(), "file vanished during backup, skipping");
                continue;
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", pending.source.display()))
            }
        };

        let size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(file_mode(&pending.source));
        header.set_mtime(file_mtime(&pending.source));
        builder
            .append_data(&mut header, &pending.archive_path, bytes.as_slice())
            .with_context(|| format!("failed to archive {}", pending.source.display()))?;

        entries.push(ManifestEntry {
            path: pending.archive_path.clone(),
            size,
            sha256: sha256_bytes(&bytes),
        });
    }

    let encoder = builder.into_inner().context("failed to finish tar stream")?;
    let writer = encoder.finish().context("failed to finish gzip stream")?;
    let file = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush archive: {}", e.error()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", path.display()))?;

    Ok(entries)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o7777)
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    0o644
}

fn file_mtime(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// List archives for `prefix` in `dir`, oldest first.
///
/// Archive names embed a sortable timestamp, so name order is age order.
/// A missing directory yields an empty list.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be read.
pub fn list_backups(dir: &Path, prefix: &str) -> anyhow::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read backups dir {}", dir.display()))
        }
    };

    let mut archives = Vec::new();
    for entry in entries {
        let entry = entry.context("failed to read directory entry")?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if archive_name_tail(name, prefix) == Some(ARCHIVE_EXT) && entry.path().is_file() {
            archives.push(entry.path());
        }
    }
    archives.sort();
    Ok(archives)
}

/// Newest archive for `prefix` in `dir`, if any.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be read.
pub fn latest_backup(dir: &Path, prefix: &str) -> anyhow::Result<Option<PathBuf>> {
    Ok(list_backups(dir, prefix)?.pop())
}

/// Keep the newest `keep` archives and delete the rest with their manifests.
///
/// Leftover `.partial` files from interrupted backups are removed too.
/// Returns the archives that were deleted.
///
/// # Errors
///
/// Returns an error if the directory cannot be read or a file cannot be removed.
pub fn prune_backups(dir: &Path, prefix: &str, keep: usize) -> anyhow::Result<Vec<PathBuf>> {
    let archives = list_backups(dir, prefix)?;
    let excess = archives.len().saturating_sub(keep);
    let mut removed = Vec::with_capacity(excess);

    for archive in archives.into_iter().take(excess) {
        fs::remove_file(&archive)
            .with_context(|| format!("failed to remove {}", archive.display()))?;
        let manifest = manifest_path(&archive);
        match fs::remove_file(&manifest) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", manifest.display()))
            }
        }
        info!(archive = %archive.display(), "pruned old backup");
        removed.push(archive);
    }

    remove_partials(dir, prefix)?;
    Ok(removed)
}

fn remove_partials(dir: &Path, prefix: &str) -> anyhow::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read backups dir {}", dir.display()))
        }
    };
    for entry in entries {
        let entry = entry.context("failed to read directory entry")?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stale = archive_name_tail(&name, prefix)
            .is_some_and(|tail| tail.starts_with(ARCHIVE_EXT) && tail.ends_with(PARTIAL_SUFFIX));
        if stale {
            debug!(path = %entry.path().display(), "removing stale partial file");
            fs::remove_file(entry.path())
                .with_context(|| format!("failed to remove {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Split `<prefix>-<YYYYMMDD-HHMMSS><tail>` and return `tail`.
///
/// Returns `None` unless `prefix` is followed directly by a valid timestamp,
/// so `server` never claims the archives of `server-old`.
fn archive_name_tail<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let stamp = rest.get(..STAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    rest.get(STAMP_LEN..)
}

/// Create, prune, optionally verify, and record a backup.
///
/// Database failures are logged and do not fail the cycle; the archive on
/// disk is the source of truth.
///
/// # Errors
///
/// Returns an error if creating, pruning, or verifying the archive fails.
pub async fn run_cycle(
    config: &BackupConfig,
    db: Option<&StateDb>,
    verify_after: bool,
) -> anyhow::Result<BackupCycle> {
    let backup = create_backup(config, Utc::now()).await?;

    if let Some(db) = db {
        let record = BackupRecord {
            id: 0,
            created_at: backup.manifest.created_at.clone(),
            archive_path: backup.archive_path.display().to_string(),
            archive_sha256: backup.manifest.archive_sha256.clone(),
            size_bytes: i64::try_from(backup.manifest.archive_size).unwrap_or(i64::MAX),
            file_count: i64::try_from(backup.manifest.files.len()).unwrap_or(i64::MAX),
            verified: None,
            verified_at: None,
            verify_error: None,
        };
        if let Err(e) = db.insert_backup(&record).await {
            warn!(error = %e, "failed to record backup");
        }
    }

    let pruned = {
        let dir = config.backups_dir.clone();
        let prefix = config.prefix.clone();
        let keep = config.keep;
        tokio::task::spawn_blocking(move || prune_backups(&dir, &prefix, keep))
            .await
            .context("prune task panicked")??
    };

    if let Some(db) = db {
        for archive in &pruned {
            if let Err(e) = db.remove_backup(&archive.display().to_string()).await {
                warn!(error = %e, "failed to forget pruned backup");
            }
        }
    }

    let report = if verify_after {
        let report = verify::verify(&backup.archive_path).await?;
        if let Some(db) = db {
            record_verification(db, &report).await;
        }
        Some(report)
    } else {
        None
    };

    Ok(BackupCycle {
        backup,
        pruned,
        report,
    })
}

/// Store a verification report in the state db, logging failures.
pub async fn record_verification(db: &StateDb, report: &VerifyReport) {
    let error = if report.is_ok() {
        None
    } else {
        Some(report.summary())
    };
    match db
        .set_backup_verified(
            &report.archive.display().to_string(),
            report.is_ok(),
            &Utc::now().to_rfc3339(),
            error.as_deref(),
        )
        .await
    {
        Ok(true) => {}
        Ok(false) => debug!(archive = %report.archive.display(), "verified archive has no history row"),
        Err(e) => warn!(error = %e, "failed to record verification result"),
    }
}

/// Cron-driven backup schedule.
#[derive(Debug, Clone)]
pub struct BackupSchedule {
    schedule: cron::Schedule,
    last_run: DateTime<Utc>,
}

impl BackupSchedule {
    /// Parse a cron expression (seconds field first).
    ///
    /// `started_at` stands in for the last run, so the first backup fires
    /// on the first scheduled slot after the agent starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is invalid.
    pub fn parse(expr: &str, started_at: DateTime<Utc>) -> anyhow::Result<Self> {
        let schedule = cron::Schedule::from_str(expr)
            .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr}': {e}"))?;
        Ok(Self {
            schedule,
            last_run: started_at,
        })
    }

    /// Whether a scheduled slot lies in `(last_run, now]`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule
            .after(&self.last_run)
            .take(1)
            .any(|next| next <= now)
    }

    /// Record that a backup ran at `at`.
    pub fn record_run(&mut self, at: DateTime<Utc>) {
        self.last_run = at;
    }

    /// Next scheduled slot after the last run.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.schedule.after(&self.last_run).next()
    }
}

/// Compute the SHA-256 hex digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 hex digest of a file without loading it whole.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(buf.get(..n).unwrap_or_default());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Append a suffix to the full file name of `path`.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Hashing sink used when streaming archive entries.
pub(crate) struct HashingWriter {
    hasher: Sha256,
    written: u64,
}

impl HashingWriter {
    pub(crate) fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub(crate) fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.written)
    }
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        self.written = self
            .written
            .saturating_add(u64::try_from(buf.len()).unwrap_or(u64::MAX));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
