//! Local operator agent for a single Cobblemon server.
//!
//! Watches the server log for crash and warning signatures, writes Markdown
//! incident notes into `docs/05_Postmortems/`, and takes verified snapshot
//! backups of server state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Snapshot archives, retention, and the backup schedule.
pub mod backup;
/// Signature matching for log lines.
pub mod classifier;
/// Configuration loading and validation.
pub mod config;
/// SQLite history of incidents and backups.
pub mod db;
/// Incident note rendering and writing.
pub mod incident;
/// Tracing subscriber setup.
pub mod logging;
/// One-shot scan of the log tail.
pub mod scan;
/// Incremental reading of the server log.
pub mod tailer;
/// Archive integrity checks.
pub mod verify;
/// Continuous watching for the daemon.
pub mod watch;
