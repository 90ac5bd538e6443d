//! Continuous log watching for the `watch` daemon.
//!
//! Each poll classifies only the lines appended since the previous poll.
//! Hits whose titles are still in cooldown are dropped first. The rest of
//! the batch becomes at most one incident, titled after its most severe hit.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};
use tracing::{debug, info};

use crate::classifier::{primary_hit, Classifier, Severity};
use crate::config::AgentConfig;
use crate::incident::{write_incident, IncidentNote, IncidentRecorder};
use crate::tailer::LogTailer;

/// An incident written by [`LogWatch::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedIncident {
    /// Incident title.
    pub title: String,
    /// Severity of the primary hit.
    pub severity: Severity,
    /// Number of hits listed in the note.
    pub hit_count: usize,
    /// Path of the written note.
    pub note_path: PathBuf,
    /// Detection time, as written into the note.
    pub detected_at: DateTime<Local>,
}

/// Tailer, classifier, and recorder wired together for the daemon loop.
pub struct LogWatch {
    tailer: LogTailer,
    classifier: Classifier,
    recorder: IncidentRecorder,
    context: VecDeque<String>,
    context_lines: usize,
    max_hits: usize,
    postmortems_dir: PathBuf,
    runbook: PathBuf,
    config_path: PathBuf,
}

impl LogWatch {
    /// Build a watcher from config around an existing tailer.
    ///
    /// # Errors
    ///
    /// Returns an error if the detection patterns fail to compile.
    pub fn new(config: &AgentConfig, config_path: &Path, tailer: LogTailer) -> anyhow::Result<Self> {
        let classifier = Classifier::with_builtins(&config.patterns, config.scan.builtin_patterns)?;
        Ok(Self {
            tailer,
            classifier,
            recorder: IncidentRecorder::new(config.watch.cooldown_mins),
            context: VecDeque::with_capacity(config.watch.context_lines),
            context_lines: config.watch.context_lines,
            max_hits: config.scan.max_hits,
            postmortems_dir: config.incidents.postmortems_dir.clone(),
            runbook: config.incidents.runbook.clone(),
            config_path: config_path.to_owned(),
        })
    }

    /// Number of compiled patterns.
    pub fn pattern_count(&self) -> usize {
        self.classifier.len()
    }

    /// Read new lines and record an incident if any of them matched.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or the note cannot be written.
    pub fn poll(&mut self, now: DateTime<Local>) -> anyhow::Result<Option<WatchedIncident>> {
        let lines = self.tailer.poll()?;
        if lines.is_empty() {
            return Ok(None);
        }

        let raw: Vec<&str> = lines.iter().map(|l| l.raw.as_str()).collect();
        for line in &raw {
            if self.context.len() == self.context_lines {
                self.context.pop_front();
            }
            if self.context_lines > 0 {
                self.context.push_back((*line).to_owned());
            }
        }

        let mut hits = self.classifier.find_matches(&raw);
        hits.retain(|hit| {
            let cooling = self.recorder.is_in_cooldown(&hit.pattern, now);
            if cooling {
                debug!(title = %hit.pattern, "hit in cooldown, skipping");
            }
            !cooling
        });
        let Some(primary) = primary_hit(&hits) else {
            return Ok(None);
        };
        let title = primary.pattern.clone();
        let severity = primary.severity;

        let listed: Vec<_> = hits.into_iter().take(self.max_hits).collect();
        let hit_count = listed.len();
        let note = IncidentNote {
            title: title.clone(),
            detected_at: now,
            log_path: self.tailer.path().to_owned(),
            hits: listed,
            context: self.context.iter().cloned().collect(),
            runbook: self.runbook.clone(),
            config_path: self.config_path.clone(),
        };
        let note_path = write_incident(&self.postmortems_dir, &note)?;
        self.recorder.record(&title, now);

        info!(
            title = %title,
            severity = %severity,
            hits = hit_count,
            path = %note_path.display(),
            "incident recorded"
        );

        Ok(Some(WatchedIncident {
            title,
            severity,
            hit_count,
            note_path,
            detected_at: now,
        }))
    }

    /// Run [`poll`](Self::poll) on the blocking thread pool.
    ///
    /// The watcher moves into the task and is handed back with the result,
    /// so file reads and note writes never stall the async runtime.
    ///
    /// # Errors
    ///
    /// Returns an error only if the blocking task panicked or was cancelled;
    /// poll failures come back in the inner result.
    pub async fn poll_blocking(
        mut self,
        now: DateTime<Local>,
    ) -> anyhow::Result<(Self, anyhow::Result<Option<WatchedIncident>>)> {
        tokio::task::spawn_blocking(move || {
            let polled = self.poll(now);
            (self, polled)
        })
        .await
        .context("watch poll task failed")
    }
}
