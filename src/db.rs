//! Agent state database backed by SQLite.
//!
//! Stores incident and backup history for the `history` command.
//! Migration is applied inline via `include_str!` on first open.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// The agent's SQLite state database.
pub struct StateDb {
    pool: SqlitePool,
}

/// A recorded incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// Unique identifier (`inc-<uuid>`).
    pub id: String,
    /// When the incident was detected (RFC 3339).
    pub detected_at: String,
    /// Incident title.
    pub title: String,
    /// Severity of the primary signal.
    pub severity: String,
    /// Path of the written note, if one was written.
    pub note_path: Option<String>,
    /// Number of signals listed in the note.
    pub hit_count: i64,
    /// Log file the signals came from.
    pub log_path: String,
}

impl IncidentRecord {
    /// Build a record with a fresh identifier.
    pub fn new(
        detected_at: &str,
        title: &str,
        severity: &str,
        note_path: Option<&Path>,
        hit_count: usize,
        log_path: &Path,
    ) -> Self {
        Self {
            id: format!("inc-{}", uuid::Uuid::new_v4()),
            detected_at: detected_at.to_owned(),
            title: title.to_owned(),
            severity: severity.to_owned(),
            note_path: note_path.map(|p| p.display().to_string()),
            hit_count: i64::try_from(hit_count).unwrap_or(i64::MAX),
            log_path: log_path.display().to_string(),
        }
    }
}

/// A recorded backup archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Auto-increment row ID.
    pub id: i64,
    /// When the archive was created (RFC 3339).
    pub created_at: String,
    /// Archive location.
    pub archive_path: String,
    /// Hex SHA-256 of the archive.
    pub archive_sha256: String,
    /// Archive size in bytes.
    pub size_bytes: i64,
    /// Number of files in the archive.
    pub file_count: i64,
    /// Verification result, if verified.
    pub verified: Option<bool>,
    /// When the archive was last verified (RFC 3339).
    pub verified_at: Option<String>,
    /// Summary of verification issues, if any.
    pub verify_error: Option<String>,
}

impl StateDb {
    /// Open (or create) the state database at the given path and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create state db directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open state db at {}", path.display()))?;

        let migration_sql = include_str!("../migrations/001_agent_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply agent schema migration")?;

        Ok(Self { pool })
    }

    /// Insert an incident record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn insert_incident(&self, incident: &IncidentRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO incidents (id, detected_at, title, severity, note_path, hit_count, log_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&incident.id)
        .bind(&incident.detected_at)
        .bind(&incident.title)
        .bind(&incident.severity)
        .bind(&incident.note_path)
        .bind(incident.hit_count)
        .bind(&incident.log_path)
        .execute(&self.pool)
        .await
        .context("failed to insert incident record")?;

        Ok(())
    }

    /// Query the most recent incidents, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn recent_incidents(&self, limit: i64) -> anyhow::Result<Vec<IncidentRecord>> {
        let rows = sqlx::query_as::<_, IncidentRow>(
            "SELECT id, detected_at, title, severity, note_path, hit_count, log_path
             FROM incidents
             ORDER BY detected_at DESC
             LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query recent incidents")?;

        Ok(rows.into_iter().map(incident_row_into_record).collect())
    }

    /// Insert a backup record. Returns the assigned row ID.
    ///
    /// Re-recording the same archive path replaces the earlier row.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn insert_backup(&self, record: &BackupRecord) -> anyhow::Result<i64> {
        let verified_int: Option<i64> = record.verified.map(|v| if v { 1 } else { 0 });

        let result = sqlx::query(
            "INSERT OR REPLACE INTO backups
                (created_at, archive_path, archive_sha256, size_bytes, file_count, verified, verified_at, verify_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&record.created_at)
        .bind(&record.archive_path)
        .bind(&record.archive_sha256)
        .bind(record.size_bytes)
        .bind(record.file_count)
        .bind(verified_int)
        .bind(&record.verified_at)
        .bind(&record.verify_error)
        .execute(&self.pool)
        .await
        .context("failed to insert backup record")?;

        Ok(result.last_insert_rowid())
    }

    /// Store a verification result for an archive.
    ///
    /// Returns `false` if no backup row matches the path (e.g. an archive
    /// created before the state db existed).
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn set_backup_verified(
        &self,
        archive_path: &str,
        verified: bool,
        verified_at: &str,
        verify_error: Option<&str>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE backups SET
                verified = ?2,
                verified_at = ?3,
                verify_error = ?4
             WHERE archive_path = ?1",
        )
        .bind(archive_path)
        .bind(if verified { 1_i64 } else { 0_i64 })
        .bind(verified_at)
        .bind(verify_error)
        .execute(&self.pool)
        .await
        .context("failed to update backup verification")?;

        Ok(result.rows_affected() > 0)
    }

    /// Forget a backup whose archive has been pruned.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn remove_backup(&self, archive_path: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM backups WHERE archive_path = ?1")
            .bind(archive_path)
            .execute(&self.pool)
            .await
            .context("failed to delete backup record")?;
        Ok(())
    }

    /// Query the most recent backups, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn recent_backups(&self, limit: i64) -> anyhow::Result<Vec<BackupRecord>> {
        let rows = sqlx::query_as::<_, BackupRow>(
            "SELECT id, created_at, archive_path, archive_sha256, size_bytes, file_count, verified, verified_at, verify_error
             FROM backups
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query recent backups")?;

        Ok(rows.into_iter().map(backup_row_into_record).collect())
    }
}

/// Raw row tuple from the `incidents` table.
type IncidentRow = (String, String, String, String, Option<String>, i64, String);

fn incident_row_into_record(row: IncidentRow) -> IncidentRecord {
    let (id, detected_at, title, severity, note_path, hit_count, log_path) = row;
    IncidentRecord {
        id,
        detected_at,
        title,
        severity,
        note_path,
        hit_count,
        log_path,
    }
}

/// Raw row tuple from the `backups` table.
type BackupRow = (
    i64,
    String,
    String,
    String,
    i64,
    i64,
    Option<i64>,
    Option<String>,
    Option<String>,
);

fn backup_row_into_record(row: BackupRow) -> BackupRecord {
    let (
        id,
        created_at,
        archive_path,
        archive_sha256,
        size_bytes,
        file_count,
        verified,
        verified_at,
        verify_error,
    ) = row;
    BackupRecord {
        id,
        created_at,
        archive_path,
        archive_sha256,
        size_bytes,
        file_count,
        verified: verified.map(|v| v != 0),
        verified_at,
        verify_error,
    }
}
