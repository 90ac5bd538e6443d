//! Tests for agent configuration loading, defaults, and validation.

use std::path::{Path, PathBuf};

use cobblemon_agent::classifier::Severity;
use cobblemon_agent::config::{load_config, AgentConfig};

fn parse(toml_content: &str) -> AgentConfig {
    toml::from_str(toml_content).expect("parse config")
}

#[test]
fn parse_complete_config() {
    let toml_content = r#"
[server]
log_file = "srv/logs/latest.log"
state_dir = "state"

[scan]
tail_lines = 500
max_hits = 3
builtin_patterns = false

[watch]
interval_secs = 10
context_lines = 20
cooldown_mins = 60

[incidents]
postmortems_dir = "notes"
runbook = "RUNBOOK.md"

[backup]
enabled = false
sources = ["srv/world", "srv/config"]
backups_dir = "snapshots"
prefix = "cobble"
schedule = "0 30 3 * * *"
keep = 4
exclude = ["*.lock"]
verify_after = false

[[patterns]]
name = "Spawn failure"
match = "failed to spawn"
severity = "high"

[[patterns]]
name = "Anything odd"
match = "odd"
"#;

    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, toml_content).expect("write config");

    let config = load_config(&config_path).expect("load config");

    assert_eq!(config.server.log_file, PathBuf::from("srv/logs/latest.log"));
    assert_eq!(config.server.state_dir, PathBuf::from("state"));
    assert_eq!(config.scan.tail_lines, 500);
    assert_eq!(config.scan.max_hits, 3);
    assert!(!config.scan.builtin_patterns);
    assert_eq!(config.watch.interval_secs, 10);
    assert_eq!(config.watch.context_lines, 20);
    assert_eq!(config.watch.cooldown_mins, 60);
    assert_eq!(config.incidents.postmortems_dir, PathBuf::from("notes"));
    assert_eq!(config.incidents.runbook, PathBuf::from("RUNBOOK.md"));
    assert!(!config.backup.enabled);
    assert_eq!(
        config.backup.sources,
        vec![PathBuf::from("srv/world"), PathBuf::from("srv/config")]
    );
    assert_eq!(config.backup.backups_dir, PathBuf::from("snapshots"));
    assert_eq!(config.backup.prefix, "cobble");
    assert_eq!(config.backup.schedule, "0 30 3 * * *");
    assert_eq!(config.backup.keep, 4);
    assert_eq!(config.backup.exclude, vec!["*.lock".to_owned()]);
    assert!(!config.backup.verify_after);

    assert_eq!(config.patterns.len(), 2);
    assert_eq!(config.patterns[0].name, "Spawn failure");
    assert_eq!(config.patterns[0].regex, "failed to spawn");
    assert_eq!(config.patterns[0].severity, Severity::High);
    // Severity defaults to medium.
    assert_eq!(config.patterns[1].severity, Severity::Medium);
}

#[test]
fn empty_config_uses_defaults() {
    let config = parse("");
    config.validate().expect("defaults should validate");

    assert_eq!(config.server.log_file, PathBuf::from("logs/latest.log"));
    assert_eq!(config.server.state_dir, PathBuf::from("agent/state"));
    assert_eq!(config.scan.tail_lines, 200);
    assert_eq!(config.scan.max_hits, 10);
    assert!(config.scan.builtin_patterns);
    assert_eq!(config.watch.interval_secs, 5);
    assert_eq!(
        config.incidents.postmortems_dir,
        PathBuf::from("docs/05_Postmortems")
    );
    assert_eq!(config.incidents.runbook, PathBuf::from("docs/04_Runbook.md"));
    assert!(config.backup.enabled);
    assert_eq!(config.backup.keep, 10);
    assert_eq!(config.backup.exclude, vec!["session.lock".to_owned()]);
    assert!(config.patterns.is_empty());
}

#[test]
fn partial_section_keeps_other_defaults() {
    let config = parse(
        r#"
[scan]
tail_lines = 50
"#,
    );
    assert_eq!(config.scan.tail_lines, 50);
    assert_eq!(config.scan.max_hits, 10);
    assert_eq!(config.watch.cooldown_mins, 15);
}

#[test]
fn state_paths_live_under_state_dir() {
    let config = parse(
        r#"
[server]
state_dir = "/var/lib/agent"
"#,
    );
    let paths = config.state_paths();
    assert_eq!(paths.root, Path::new("/var/lib/agent"));
    assert_eq!(paths.state_db, Path::new("/var/lib/agent/state.db"));
    assert_eq!(paths.logs_dir, Path::new("/var/lib/agent/logs"));
}

#[test]
fn validate_rejects_zero_tail_lines() {
    let config = parse("[scan]\ntail_lines = 0\n");
    let err = config.validate().expect_err("should reject");
    assert!(err.to_string().contains("tail_lines"));
}

#[test]
fn validate_rejects_zero_max_hits() {
    let config = parse("[scan]\nmax_hits = 0\n");
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_out_of_range_interval() {
    assert!(parse("[watch]\ninterval_secs = 0\n").validate().is_err());
    assert!(parse("[watch]\ninterval_secs = 86400\n").validate().is_err());
}

#[test]
fn validate_rejects_zero_keep() {
    let config = parse("[backup]\nkeep = 0\n");
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_bad_prefix() {
    assert!(parse("[backup]\nprefix = \"\"\n").validate().is_err());
    assert!(parse("[backup]\nprefix = \"../evil\"\n").validate().is_err());
}

#[test]
fn validate_rejects_bad_cron() {
    let config = parse("[backup]\nschedule = \"every six hours\"\n");
    let err = config.validate().expect_err("should reject");
    assert!(format!("{err:#}").contains("cron"));
}

#[test]
fn validate_rejects_invalid_pattern_regex() {
    let config = parse(
        r#"
[[patterns]]
name = "Broken"
match = "(unclosed"
"#,
    );
    let err = config.validate().expect_err("should reject");
    assert!(format!("{err:#}").contains("Broken"));
}

#[test]
fn validate_rejects_unknown_severity_at_parse_time() {
    let result: Result<AgentConfig, _> = toml::from_str(
        r#"
[[patterns]]
name = "X"
match = "x"
severity = "apocalyptic"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn load_config_missing_file_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let result = load_config(&dir.path().join("nope.toml"));
    assert!(result.is_err());
}

#[test]
fn load_config_malformed_toml_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[scan\ntail_lines = ").expect("write");
    let err = load_config(&path).expect_err("should fail");
    assert!(format!("{err:#}").contains("failed to parse"));
}

#[test]
fn shipped_example_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("agent/config.example.toml");
    let config = load_config(&path).expect("example config should load");
    assert!(!config.patterns.is_empty());
    assert!(config.backup.exclude.contains(&"session.lock".to_owned()));
}
