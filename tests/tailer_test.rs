//! Tests for log tailing and line parsing.

use std::io::Write;

use cobblemon_agent::tailer::{tail_last_lines, LogLevel, LogLine, LogTailer, MAX_LINE_LEN};

fn append(path: &std::path::Path, text: &str) {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open append");
    f.write_all(text.as_bytes()).expect("append");
}

#[test]
fn tail_returns_last_n_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    let content: String = (1..=10).map(|i| format!("line {i}\n")).collect();
    std::fs::write(&log, content).expect("write log");

    let lines = tail_last_lines(&log, 3).expect("tail");
    assert_eq!(lines, vec!["line 8", "line 9", "line 10"]);
}

#[test]
fn tail_returns_everything_when_file_is_short() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    std::fs::write(&log, "a\nb\n").expect("write log");

    let lines = tail_last_lines(&log, 200).expect("tail");
    assert_eq!(lines, vec!["a", "b"]);
}

#[test]
fn tail_keeps_unterminated_last_line_and_strips_crlf() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    std::fs::write(&log, "first\r\nsecond").expect("write log");

    let lines = tail_last_lines(&log, 5).expect("tail");
    assert_eq!(lines, vec!["first", "second"]);
}

#[test]
fn tail_missing_file_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lines = tail_last_lines(&dir.path().join("missing.log"), 10).expect("tail");
    assert!(lines.is_empty());
}

#[test]
fn tail_zero_lines_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    std::fs::write(&log, "a\n").expect("write log");
    assert!(tail_last_lines(&log, 0).expect("tail").is_empty());
}

#[test]
fn tail_replaces_invalid_utf8() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    std::fs::write(&log, b"ok\nbad \xff byte\n").expect("write log");

    let lines = tail_last_lines(&log, 5).expect("tail");
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1], "bad \u{fffd} byte");
}

#[test]
fn tailer_reads_incrementally() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    let mut tailer = LogTailer::from_start(log.clone());

    append(&log, "[10:00:00] [Server thread/INFO]: first\n");
    let batch = tailer.poll().expect("poll 1");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message, "first");

    append(&log, "[10:00:01] [Server thread/INFO]: second\n");
    let batch = tailer.poll().expect("poll 2");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message, "second");

    assert!(tailer.poll().expect("poll 3").is_empty());
}

#[test]
fn tailer_from_end_skips_existing_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    std::fs::write(&log, "old line\n").expect("write log");

    let mut tailer = LogTailer::from_end(log.clone()).expect("from_end");
    assert_eq!(tailer.offset(), 9);
    assert!(tailer.poll().expect("poll").is_empty());

    append(&log, "new line\n");
    let batch = tailer.poll().expect("poll");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].raw, "new line");
}

#[test]
fn tailer_holds_partial_line_until_completed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    let mut tailer = LogTailer::from_start(log.clone());

    append(&log, "complete\nhalf");
    let batch = tailer.poll().expect("poll 1");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].raw, "complete");

    append(&log, " done\n");
    let batch = tailer.poll().expect("poll 2");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].raw, "half done");
}

#[test]
fn tailer_restarts_after_rotation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    let mut tailer = LogTailer::from_start(log.clone());

    append(&log, "a long line from the previous server run\n");
    assert_eq!(tailer.poll().expect("poll 1").len(), 1);

    // Server restart: latest.log is replaced by a shorter file.
    std::fs::write(&log, "fresh\n").expect("rotate");
    let batch = tailer.poll().expect("poll 2");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].raw, "fresh");
}

#[test]
fn tailer_missing_file_then_created() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    let mut tailer = LogTailer::from_end(log.clone()).expect("from_end");
    assert_eq!(tailer.offset(), 0);
    assert!(tailer.poll().expect("poll missing").is_empty());

    append(&log, "server starting\n");
    let batch = tailer.poll().expect("poll created");
    assert_eq!(batch.len(), 1);
}

#[test]
fn tailer_discards_oversized_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("latest.log");
    let mut tailer = LogTailer::from_start(log.clone());

    let huge = "x".repeat(MAX_LINE_LEN + 10);
    append(&log, &format!("{huge}\nafter\n"));

    let batch = tailer.poll().expect("poll");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].raw, "after");
}

#[test]
fn parse_vanilla_layout() {
    let line = LogLine::parse("[12:34:56] [Server thread/WARN]: Can't keep up!");
    assert_eq!(line.time.as_deref(), Some("12:34:56"));
    assert_eq!(line.thread.as_deref(), Some("Server thread"));
    assert_eq!(line.level, LogLevel::Warn);
    assert_eq!(line.logger, None);
    assert_eq!(line.message, "Can't keep up!");
}

#[test]
fn parse_mod_loader_layout() {
    let line = LogLine::parse(
        "[12Oct2024 12:34:56.789] [Server thread/ERROR] [cobblemon/]: Failed to load species",
    );
    assert_eq!(line.time.as_deref(), Some("12Oct2024 12:34:56.789"));
    assert_eq!(line.thread.as_deref(), Some("Server thread"));
    assert_eq!(line.level, LogLevel::Error);
    assert_eq!(line.logger.as_deref(), Some("cobblemon"));
    assert_eq!(line.message, "Failed to load species");
}

#[test]
fn parse_thread_name_with_slash() {
    let line = LogLine::parse("[00:00:01] [Netty Epoll/IO #1/INFO]: connected");
    assert_eq!(line.thread.as_deref(), Some("Netty Epoll/IO #1"));
    assert_eq!(line.level, LogLevel::Info);
}

#[test]
fn parse_unstructured_line() {
    let line = LogLine::parse("\tat net.minecraft.server.MinecraftServer.run(MinecraftServer.java:123)");
    assert_eq!(line.level, LogLevel::Unknown);
    assert_eq!(line.time, None);
    assert_eq!(line.message, line.raw);
}
