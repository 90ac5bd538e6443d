//! Markdown incident notes written into the postmortems directory.
//!
//! One note per detected incident: the signals that fired, the log tail
//! around them, and pointers to the runbook and pattern config.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};
use tracing::debug;

use crate::classifier::Hit;

/// Upper bound on numeric suffixes tried for a colliding file name.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Everything needed to render one incident note.
#[derive(Debug, Clone)]
pub struct IncidentNote {
    /// Incident title (the primary pattern's name).
    pub title: String,
    /// When the incident was detected.
    pub detected_at: DateTime<Local>,
    /// Log file the signals came from.
    pub log_path: PathBuf,
    /// Signals listed in the note.
    pub hits: Vec<Hit>,
    /// Log lines shown in the context block.
    pub context: Vec<String>,
    /// Runbook referenced from the next steps.
    pub runbook: PathBuf,
    /// Config file referenced from the next steps.
    pub config_path: PathBuf,
}

impl IncidentNote {
    /// Render the note as Markdown.
    pub fn render(&self) -> String {
        let mut body: Vec<String> = Vec::new();
        body.push(format!("# Incident: {}", self.title));
        body.push(String::new());
        body.push(format!(
            "- Time: {}",
            self.detected_at.format("%Y-%m-%dT%H:%M:%S")
        ));
        body.push(format!("- Log: `{}`", self.log_path.display()));
        body.push(String::new());
        body.push("## Detected signals".to_owned());
        if self.hits.is_empty() {
            body.push("- (none)".to_owned());
        } else {
            for hit in &self.hits {
                body.push(format!(
                    "- **{}** ({}): {}",
                    hit.pattern,
                    hit.severity,
                    inline_code(&hit.line)
                ));
            }
        }
        body.push(String::new());
        body.push("## Context (tail)".to_owned());
        body.push("```log".to_owned());
        body.extend(
            self.context
                .iter()
                .map(|l| l.trim_end_matches(['\n', '\r']).to_owned()),
        );
        body.push("```".to_owned());
        body.push(String::new());
        body.push("## Next steps".to_owned());
        body.push(format!(
            "- Add runbook steps you took in `{}`.",
            self.runbook.display()
        ));
        body.push(format!(
            "- If this repeats, add a new detection pattern in `{}`.",
            self.config_path.display()
        ));
        body.push(String::new());

        let mut text = body.join("\n");
        text.push('\n');
        text
    }

    /// File name for this note, without collision handling.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.md",
            self.detected_at.format("%Y-%m-%d_%H-%M-%S"),
            slugify(&self.title)
        )
    }
}

/// Write a note into `dir`, creating the directory if needed.
///
/// If a note with the same name already exists, `_2`, `_3`, ... is appended
/// to the stem; existing notes are never overwritten.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the file cannot
/// be written.
pub fn write_incident(dir: &Path, note: &IncidentNote) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create postmortems dir {}", dir.display()))?;

    let name = note.file_name();
    let stem = name.strip_suffix(".md").unwrap_or(&name);
    let body = note.render();

    for attempt in 1..=MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 1 {
            dir.join(&name)
        } else {
            dir.join(format!("{stem}_{attempt}.md"))
        };

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                file.write_all(body.as_bytes())
                    .with_context(|| format!("failed to write {}", candidate.display()))?;
                debug!(path = %candidate.display(), "incident note written");
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to create {}", candidate.display()))
            }
        }
    }

    anyhow::bail!(
        "no free incident file name for '{name}' in {}",
        dir.display()
    )
}

/// Per-title cooldown so a repeating signature produces one note per window.
#[derive(Debug)]
pub struct IncidentRecorder {
    cooldown: chrono::Duration,
    last_recorded: HashMap<String, DateTime<Local>>,
}

impl IncidentRecorder {
    /// Create a recorder with the given cooldown in minutes.
    pub fn new(cooldown_mins: u64) -> Self {
        let mins = i64::try_from(cooldown_mins).unwrap_or(i64::MAX);
        Self {
            cooldown: chrono::Duration::try_minutes(mins).unwrap_or(chrono::Duration::MAX),
            last_recorded: HashMap::new(),
        }
    }

    /// Whether an incident with this title is still inside its cooldown.
    pub fn is_in_cooldown(&self, title: &str, now: DateTime<Local>) -> bool {
        let Some(last) = self.last_recorded.get(title) else {
            return false;
        };
        now.signed_duration_since(*last) < self.cooldown
    }

    /// Mark a title as recorded at `now`.
    pub fn record(&mut self, title: &str, now: DateTime<Local>) {
        self.last_recorded.insert(title.to_owned(), now);
    }
}

/// Make a title safe to use in a file name.
///
/// Spaces become `_`; anything outside `[A-Za-z0-9._-]` also becomes `_`,
/// which keeps path separators out of the name.
pub fn slugify(title: &str) -> String {
    let slug: String = title
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_start_matches('.');
    if slug.is_empty() {
        "incident".to_owned()
    } else {
        slug.to_owned()
    }
}

/// Wrap text in a Markdown code span that survives embedded backticks.
fn inline_code(text: &str) -> String {
    if text.contains('`') {
        format!("`` {text} ``")
    } else {
        format!("`{text}`")
    }
}
