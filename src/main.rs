//! Agent CLI entry point.
//!
//! Provides `scan`, `watch`, `backup`, `verify`, `history`, and
//! `check-config` subcommands for operating a single Cobblemon server.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use cobblemon_agent::backup::{self, BackupSchedule};
use cobblemon_agent::classifier::Classifier;
use cobblemon_agent::config::{load_config, AgentConfig, DEFAULT_CONFIG_PATH, EXAMPLE_CONFIG_PATH};
use cobblemon_agent::db::{IncidentRecord, StateDb};
use cobblemon_agent::logging;
use cobblemon_agent::scan::{run_scan, ScanOutcome};
use cobblemon_agent::tailer::LogTailer;
use cobblemon_agent::verify::{self, VerifyReport};
use cobblemon_agent::watch::LogWatch;

/// Exit code when no log lines could be read or verification failed.
const EXIT_FAILURE: u8 = 1;

/// Exit code when the config is missing or invalid.
const EXIT_CONFIG: u8 = 2;

/// Local operator agent for a Cobblemon server.
#[derive(Parser)]
#[command(name = "agent", version, about)]
struct Cli {
    /// Path to the agent config file.
    #[arg(long, global = true, env = "AGENT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Scan the tail of the server log once and write an incident note on a match.
    Scan {
        /// Print matches without writing a note.
        #[arg(long)]
        dry_run: bool,
    },
    /// Follow the server log, record incidents, and run scheduled backups.
    Watch,
    /// Create a backup now, prune old ones, and verify it.
    Backup {
        /// Skip verification of the new archive.
        #[arg(long)]
        no_verify: bool,
    },
    /// Verify a backup archive (defaults to the newest).
    Verify {
        /// Archive to verify.
        archive: Option<PathBuf>,
    },
    /// Show recent incidents and backups.
    History {
        /// Number of rows per section.
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
        limit: u32,
    },
    /// Validate the config and print a summary.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // The daemon sets up file logging once it knows the state directory.
    if !matches!(cli.command, Command::Watch) {
        logging::init_cli();
    }

    let Some(config) = load_config_or_report(&cli.config) else {
        return Ok(ExitCode::from(EXIT_CONFIG));
    };

    match cli.command {
        Command::Scan { dry_run } => handle_scan(&config, &cli.config, dry_run).await,
        Command::Watch => handle_watch(&config, &cli.config).await,
        Command::Backup { no_verify } => handle_backup(&config, no_verify).await,
        Command::Verify { archive } => handle_verify(&config, archive).await,
        Command::History { limit } => handle_history(&config, limit).await,
        Command::CheckConfig => handle_check_config(&config, &cli.config),
    }
}

/// Load the config, printing an operator-facing hint on failure.
fn load_config_or_report(path: &Path) -> Option<AgentConfig> {
    if !path.exists() {
        eprintln!(
            "Config not found: {} (copy {EXAMPLE_CONFIG_PATH} -> {})",
            path.display(),
            path.display()
        );
        return None;
    }

    match load_config(path) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Failed to load config file: {}", path.display());
            eprintln!("Error: {e:#}");
            eprintln!(
                "Hint: overwrite {} with {EXAMPLE_CONFIG_PATH} and retry",
                path.display()
            );
            None
        }
    }
}

/// Run a single scan of the log tail.
async fn handle_scan(
    config: &AgentConfig,
    config_path: &Path,
    dry_run: bool,
) -> anyhow::Result<ExitCode> {
    let outcome = run_scan(config, config_path, dry_run, Local::now())?;

    match outcome {
        ScanOutcome::NoLogLines => {
            println!(
                "No log lines read from: {}",
                config.server.log_file.display()
            );
            Ok(ExitCode::from(EXIT_FAILURE))
        }
        ScanOutcome::NoMatches => {
            println!("No incident patterns matched.");
            Ok(ExitCode::SUCCESS)
        }
        ScanOutcome::DryRun { title, hits } => {
            println!("Would record incident: {title}");
            for hit in &hits {
                println!("- {} ({}): {}", hit.pattern, hit.severity, hit.line);
            }
            Ok(ExitCode::SUCCESS)
        }
        ScanOutcome::Recorded {
            note_path,
            title,
            severity,
            hits,
            detected_at,
        } => {
            println!("Wrote incident note: {}", note_path.display());

            let record = IncidentRecord::new(
                &detected_at.with_timezone(&Utc).to_rfc3339(),
                &title,
                severity.as_str(),
                Some(&note_path),
                hits.len(),
                &config.server.log_file,
            );
            match StateDb::open(&config.state_paths().state_db).await {
                Ok(db) => {
                    if let Err(e) = db.insert_incident(&record).await {
                        warn!(error = %e, "failed to record incident");
                    }
                }
                Err(e) => warn!(error = %e, "state db unavailable, incident not recorded"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run the watch daemon until Ctrl-C.
async fn handle_watch(config: &AgentConfig, config_path: &Path) -> anyhow::Result<ExitCode> {
    let paths = config.state_paths();
    let _logging_guard = logging::init_production(&paths.logs_dir)?;

    let db = StateDb::open(&paths.state_db).await?;

    let tailer = LogTailer::from_end(config.server.log_file.clone())?;
    let mut watch = LogWatch::new(config, config_path, tailer)?;

    let mut schedule = if config.backup.enabled {
        Some(BackupSchedule::parse(&config.backup.schedule, Utc::now())?)
    } else {
        None
    };

    info!(
        log = %config.server.log_file.display(),
        patterns = watch.pattern_count(),
        interval_secs = config.watch.interval_secs,
        next_backup = ?schedule.as_ref().and_then(BackupSchedule::next_run),
        "agent watch started"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(config.watch.interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutdown requested");
                break;
            }
            _ = interval.tick() => {}
        }

        // Step 1: Poll the log and record incidents.
        let (returned, polled) = watch.poll_blocking(Local::now()).await?;
        watch = returned;
        match polled {
            Ok(Some(incident)) => {
                let record = IncidentRecord::new(
                    &incident.detected_at.with_timezone(&Utc).to_rfc3339(),
                    &incident.title,
                    incident.severity.as_str(),
                    Some(&incident.note_path),
                    incident.hit_count,
                    &config.server.log_file,
                );
                if let Err(e) = db.insert_incident(&record).await {
                    warn!(error = %e, "failed to record incident");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "log poll failed"),
        }

        // Step 2: Run a scheduled backup if one is due.
        if let Some(schedule) = schedule.as_mut() {
            let now = Utc::now();
            if schedule.is_due(now) {
                schedule.record_run(now);
                match backup::run_cycle(&config.backup, Some(&db), config.backup.verify_after)
                    .await
                {
                    Ok(cycle) => {
                        let verified = cycle.report.as_ref().map(VerifyReport::is_ok);
                        info!(
                            archive = %cycle.backup.archive_path.display(),
                            pruned = cycle.pruned.len(),
                            verified = ?verified,
                            next = ?schedule.next_run(),
                            "scheduled backup finished"
                        );
                    }
                    Err(e) => warn!(error = %e, "scheduled backup failed"),
                }
            }
        }

        debug!("watch cycle complete");
    }

    Ok(ExitCode::SUCCESS)
}

/// Create, prune, and verify a backup now.
async fn handle_backup(config: &AgentConfig, no_verify: bool) -> anyhow::Result<ExitCode> {
    let db = open_db_or_warn(config).await;

    let cycle = backup::run_cycle(&config.backup, db.as_ref(), !no_verify).await?;

    println!(
        "Wrote backup: {} ({} files, {} bytes)",
        cycle.backup.archive_path.display(),
        cycle.backup.manifest.files.len(),
        cycle.backup.manifest.archive_size
    );
    for skipped in &cycle.backup.skipped_sources {
        println!("Skipped missing source: {}", skipped.display());
    }
    for pruned in &cycle.pruned {
        println!("Pruned: {}", pruned.display());
    }

    match cycle.report {
        Some(report) => Ok(print_report(&report)),
        None => Ok(ExitCode::SUCCESS),
    }
}

/// Verify the given archive or the newest one.
async fn handle_verify(config: &AgentConfig, archive: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let archive = match archive {
        Some(path) => path,
        None => {
            match backup::latest_backup(&config.backup.backups_dir, &config.backup.prefix)? {
                Some(path) => path,
                None => {
                    println!(
                        "No backups found in: {}",
                        config.backup.backups_dir.display()
                    );
                    return Ok(ExitCode::from(EXIT_FAILURE));
                }
            }
        }
    };

    let report = verify::verify(&archive).await?;

    if let Some(db) = open_db_or_warn(config).await {
        backup::record_verification(&db, &report).await;
    }

    Ok(print_report(&report))
}

/// Print recent incidents and backups from the state db.
async fn handle_history(config: &AgentConfig, limit: u32) -> anyhow::Result<ExitCode> {
    let limit = i64::from(limit);
    let state_db = config.state_paths().state_db;
    let db = StateDb::open(&state_db)
        .await
        .with_context(|| format!("failed to open {}", state_db.display()))?;

    let incidents = db.recent_incidents(limit).await?;
    println!("Incidents:");
    if incidents.is_empty() {
        println!("  (none)");
    }
    for incident in &incidents {
        println!(
            "  {}  [{}] {}  {}",
            incident.detected_at,
            incident.severity,
            incident.title,
            incident.note_path.as_deref().unwrap_or("-")
        );
    }

    let backups = db.recent_backups(limit).await?;
    println!("Backups:");
    if backups.is_empty() {
        println!("  (none)");
    }
    for b in &backups {
        let status = match b.verified {
            Some(true) => "verified",
            Some(false) => "FAILED",
            None => "unverified",
        };
        println!(
            "  {}  {}  {} files  {} bytes  {status}",
            b.created_at, b.archive_path, b.file_count, b.size_bytes
        );
        if let Some(err) = &b.verify_error {
            println!("    {err}");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Print a summary of the validated config.
fn handle_check_config(config: &AgentConfig, config_path: &Path) -> anyhow::Result<ExitCode> {
    let classifier = Classifier::with_builtins(&config.patterns, config.scan.builtin_patterns)?;
    let schedule = BackupSchedule::parse(&config.backup.schedule, Utc::now())?;

    println!("Config OK: {}", config_path.display());
    println!("  log file:        {}", config.server.log_file.display());
    println!("  state dir:       {}", config.server.state_dir.display());
    println!(
        "  postmortems dir: {}",
        config.incidents.postmortems_dir.display()
    );
    println!("  patterns:        {}", classifier.len());
    for name in classifier.names() {
        println!("    - {name}");
    }
    println!(
        "  backups:         {} (keep {}, schedule '{}')",
        if config.backup.enabled {
            "enabled"
        } else {
            "disabled"
        },
        config.backup.keep,
        config.backup.schedule
    );
    if let Some(next) = schedule.next_run() {
        println!("  next backup:     {}", next.to_rfc3339());
    }
    for source in &config.backup.sources {
        let marker = if source.exists() { "" } else { " (missing)" };
        println!("    source: {}{marker}", source.display());
    }

    Ok(ExitCode::SUCCESS)
}

/// Open the state db, logging instead of failing when it is unavailable.
async fn open_db_or_warn(config: &AgentConfig) -> Option<StateDb> {
    match StateDb::open(&config.state_paths().state_db).await {
        Ok(db) => Some(db),
        Err(e) => {
            warn!(error = %e, "state db unavailable, history will not be updated");
            None
        }
    }
}

/// Print a verification report and map it to an exit code.
fn print_report(report: &VerifyReport) -> ExitCode {
    if report.is_ok() {
        println!(
            "Verified: {} ({} files, {} bytes)",
            report.archive.display(),
            report.files_checked,
            report.bytes_checked
        );
        ExitCode::SUCCESS
    } else {
        println!("Verification FAILED: {}", report.archive.display());
        for issue in &report.issues {
            println!("- {issue}");
        }
        ExitCode::from(EXIT_FAILURE)
    }
}
