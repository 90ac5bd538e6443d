//! Configuration loading for the agent.
//!
//! Loads `agent/config.toml` (or the path in `AGENT_CONFIG`) with per-section
//! defaults. All sections use `#[serde(default)]` so a minimal or empty
//! config file is valid. Relative paths resolve against the working
//! directory the agent is started from.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;

use crate::classifier::{Classifier, Pattern};

/// Default config location, relative to the repository root.
pub const DEFAULT_CONFIG_PATH: &str = "agent/config.toml";

/// Example config shipped with the repository.
pub const EXAMPLE_CONFIG_PATH: &str = "agent/config.example.toml";

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Server log location and agent state directory.
    #[serde(default)]
    pub server: ServerConfig,

    /// One-shot scan settings.
    #[serde(default)]
    pub scan: ScanConfig,

    /// Watch daemon settings.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Where incident notes are written.
    #[serde(default)]
    pub incidents: IncidentsConfig,

    /// Snapshot backup settings.
    #[serde(default)]
    pub backup: BackupConfig,

    /// User-defined detection patterns, evaluated before the builtins.
    #[serde(default)]
    pub patterns: Vec<Pattern>,
}

/// Server log location and agent state directory.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Path to the live server log (usually `logs/latest.log`).
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Directory for the agent's state database and its own logs.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            state_dir: default_state_dir(),
        }
    }
}

/// One-shot scan settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Number of trailing log lines to scan.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,

    /// Maximum number of hits listed in one incident note.
    #[serde(default = "default_max_hits")]
    pub max_hits: usize,

    /// Whether the builtin server signatures are evaluated.
    #[serde(default = "default_true")]
    pub builtin_patterns: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            tail_lines: default_tail_lines(),
            max_hits: default_max_hits(),
            builtin_patterns: true,
        }
    }
}

/// Watch daemon settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Seconds between log polls.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Number of recent lines kept as context for incident notes.
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,

    /// Minutes before the same incident title is recorded again.
    #[serde(default = "default_cooldown_mins")]
    pub cooldown_mins: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            context_lines: default_context_lines(),
            cooldown_mins: default_cooldown_mins(),
        }
    }
}

/// Where incident notes are written and what they point to.
#[derive(Debug, Clone, Deserialize)]
pub struct IncidentsConfig {
    /// Directory receiving incident notes.
    #[serde(default = "default_postmortems_dir")]
    pub postmortems_dir: PathBuf,

    /// Runbook referenced from the "Next steps" section.
    #[serde(default = "default_runbook")]
    pub runbook: PathBuf,
}

impl Default for IncidentsConfig {
    fn default() -> Self {
        Self {
            postmortems_dir: default_postmortems_dir(),
            runbook: default_runbook(),
        }
    }
}

/// Snapshot backup settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Whether the watch daemon runs scheduled backups.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Files or directories included in each snapshot.
    #[serde(default = "default_sources")]
    pub sources: Vec<PathBuf>,

    /// Directory receiving archives and manifests.
    #[serde(default = "default_backups_dir")]
    pub backups_dir: PathBuf,

    /// Archive file name prefix.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Cron expression (seconds field first) for scheduled backups.
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Number of archives to keep after pruning.
    #[serde(default = "default_keep")]
    pub keep: usize,

    /// File-name globs skipped while archiving.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Verify each archive right after it is created.
    #[serde(default = "default_true")]
    pub verify_after: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: default_sources(),
            backups_dir: default_backups_dir(),
            prefix: default_prefix(),
            schedule: default_schedule(),
            keep: default_keep(),
            exclude: default_exclude(),
            verify_after: true,
        }
    }
}

/// Resolved paths for the agent's own state.
#[derive(Debug, Clone)]
pub struct StatePaths {
    /// Root state directory.
    pub root: PathBuf,

    /// SQLite history database.
    pub state_db: PathBuf,

    /// Directory for the daemon's rotated JSON logs.
    pub logs_dir: PathBuf,
}

impl AgentConfig {
    /// Validate that configuration values are within sane bounds.
    ///
    /// Also compiles every detection pattern and the backup schedule so that
    /// mistakes surface at load time rather than mid-watch.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.server.log_file.as_os_str().is_empty(),
            "server.log_file must not be empty"
        );
        anyhow::ensure!(self.scan.tail_lines >= 1, "scan.tail_lines must be >= 1");
        anyhow::ensure!(self.scan.max_hits >= 1, "scan.max_hits must be >= 1");
        anyhow::ensure!(
            (1..=3600).contains(&self.watch.interval_secs),
            "watch.interval_secs must be in [1, 3600]"
        );
        anyhow::ensure!(
            self.watch.context_lines <= 10_000,
            "watch.context_lines must be <= 10000"
        );
        anyhow::ensure!(self.backup.keep >= 1, "backup.keep must be >= 1");
        anyhow::ensure!(
            !self.backup.prefix.is_empty()
                && self
                    .backup
                    .prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "backup.prefix must be non-empty and contain only [A-Za-z0-9_-]"
        );
        cron::Schedule::from_str(&self.backup.schedule)
            .map_err(|e| anyhow::anyhow!("backup.schedule is not a valid cron expression: {e}"))?;
        for pattern in &self.backup.exclude {
            glob::Pattern::new(pattern)
                .with_context(|| format!("backup.exclude entry '{pattern}' is not a valid glob"))?;
        }
        Classifier::new(&self.patterns).context("invalid detection pattern")?;
        Ok(())
    }

    /// Resolve the agent's state paths under `server.state_dir`.
    pub fn state_paths(&self) -> StatePaths {
        let root = self.server.state_dir.clone();
        StatePaths {
            state_db: root.join("state.db"),
            logs_dir: root.join("logs"),
            root,
        }
    }
}

/// Load agent configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<AgentConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read agent config at {}", path.display()))?;
    let config: AgentConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse agent config at {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

// Default value functions for serde.

fn default_log_file() -> PathBuf {
    PathBuf::from("logs/latest.log")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("agent/state")
}

fn default_tail_lines() -> usize {
    200
}

fn default_max_hits() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    5
}

fn default_context_lines() -> usize {
    50
}

fn default_cooldown_mins() -> u64 {
    15
}

fn default_postmortems_dir() -> PathBuf {
    PathBuf::from("docs/05_Postmortems")
}

fn default_runbook() -> PathBuf {
    PathBuf::from("docs/04_Runbook.md")
}

fn default_sources() -> Vec<PathBuf> {
    vec![PathBuf::from("world")]
}

fn default_backups_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_prefix() -> String {
    "server".to_owned()
}

fn default_schedule() -> String {
    "0 0 */6 * * *".to_owned()
}

fn default_keep() -> usize {
    10
}

fn default_exclude() -> Vec<String> {
    vec!["session.lock".to_owned()]
}
