//! One-shot scan: tail the log, classify, write an incident note.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::info;

use crate::classifier::{primary_hit, Classifier, Hit, Severity};
use crate::config::AgentConfig;
use crate::incident::{write_incident, IncidentNote};
use crate::tailer::tail_last_lines;

/// What a scan found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The log was missing or empty.
    NoLogLines,
    /// Lines were read but no pattern matched.
    NoMatches,
    /// Matches were found but nothing was written (`--dry-run`).
    DryRun {
        /// Title the incident would have had.
        title: String,
        /// All hits.
        hits: Vec<Hit>,
    },
    /// An incident note was written.
    Recorded {
        /// Path of the note.
        note_path: PathBuf,
        /// Incident title.
        title: String,
        /// Severity of the primary hit.
        severity: Severity,
        /// Hits listed in the note.
        hits: Vec<Hit>,
        /// Detection time, as written into the note.
        detected_at: DateTime<Local>,
    },
}

/// Tail the configured log, classify it, and write a note if anything matched.
///
/// The note lists at most `scan.max_hits` hits and carries every tailed line
/// as context. It is titled after the most severe hit.
///
/// # Errors
///
/// Returns an error if the log cannot be read, patterns fail to compile, or
/// the note cannot be written.
pub fn run_scan(
    config: &AgentConfig,
    config_path: &Path,
    dry_run: bool,
    now: DateTime<Local>,
) -> anyhow::Result<ScanOutcome> {
    let log_path = &config.server.log_file;
    let lines = tail_last_lines(log_path, config.scan.tail_lines)?;
    if lines.is_empty() {
        return Ok(ScanOutcome::NoLogLines);
    }

    let classifier = Classifier::with_builtins(&config.patterns, config.scan.builtin_patterns)?;
    let hits = classifier.find_matches(&lines);

    let Some(primary) = primary_hit(&hits) else {
        return Ok(ScanOutcome::NoMatches);
    };
    let title = primary.pattern.clone();
    let severity = primary.severity;

    if dry_run {
        return Ok(ScanOutcome::DryRun { title, hits });
    }

    let listed: Vec<Hit> = hits.into_iter().take(config.scan.max_hits).collect();
    let note = IncidentNote {
        title: title.clone(),
        detected_at: now,
        log_path: log_path.clone(),
        hits: listed.clone(),
        context: lines,
        runbook: config.incidents.runbook.clone(),
        config_path: config_path.to_owned(),
    };
    let note_path = write_incident(&config.incidents.postmortems_dir, &note)?;

    info!(
        title = %title,
        severity = %severity,
        hits = listed.len(),
        path = %note_path.display(),
        "incident note written"
    );

    Ok(ScanOutcome::Recorded {
        note_path,
        title,
        severity,
        hits: listed,
        detected_at: now,
    })
}
