//! Incremental tailing of the server's plain-text log.
//!
//! The server appends to `logs/latest.log` and rotates it on restart by
//! moving it aside and starting a fresh file. [`LogTailer`] tracks a byte
//! offset and treats a file shorter than that offset as rotated. Uses
//! synchronous `std::fs` reads since these are quick local operations.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lines longer than this are discarded rather than classified.
pub const MAX_LINE_LEN: usize = 1_048_576;

/// Log level parsed from a server log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `TRACE`
    Trace,
    /// `DEBUG`
    Debug,
    /// `INFO`
    Info,
    /// `WARN`
    Warn,
    /// `ERROR`
    Error,
    /// `FATAL`
    Fatal,
    /// Line had no recognisable level (stack trace continuation, banner, ...).
    Unknown,
}

impl LogLevel {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "TRACE" => Self::Trace,
            "DEBUG" => Self::Debug,
            "INFO" => Self::Info,
            "WARN" | "WARNING" => Self::Warn,
            "ERROR" => Self::Error,
            "FATAL" => Self::Fatal,
            _ => Self::Unknown,
        }
    }
}

/// One line of the server log, with the standard header split out when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// The full line without its trailing newline.
    pub raw: String,
    /// Timestamp text from the first bracket (`12:34:56` or `12Oct2024 12:34:56.789`).
    pub time: Option<String>,
    /// Thread name (`Server thread`, `Worker-Main-3`, ...).
    pub thread: Option<String>,
    /// Parsed level.
    pub level: LogLevel,
    /// Logger name from mod-loader layouts, if present.
    pub logger: Option<String>,
    /// Message body after the header, or the raw line if there is no header.
    pub message: String,
}

impl LogLine {
    /// Parse a raw log line.
    ///
    /// Recognises the vanilla layout `[HH:MM:SS] [Thread/LEVEL]: msg` and the
    /// mod-loader layout `[12Oct2024 12:34:56.789] [Thread/LEVEL] [logger/]: msg`.
    /// Anything else is kept verbatim with [`LogLevel::Unknown`].
    pub fn parse(raw: &str) -> Self {
        match split_header(raw) {
            Some(header) => Self {
                raw: raw.to_owned(),
                time: Some(header.time.to_owned()),
                thread: Some(header.thread.to_owned()),
                level: LogLevel::from_tag(header.level),
                logger: header.logger.map(str::to_owned),
                message: header.message.to_owned(),
            },
            None => Self {
                raw: raw.to_owned(),
                time: None,
                thread: None,
                level: LogLevel::Unknown,
                logger: None,
                message: raw.to_owned(),
            },
        }
    }
}

struct Header<'a> {
    time: &'a str,
    thread: &'a str,
    level: &'a str,
    logger: Option<&'a str>,
    message: &'a str,
}

fn split_header(raw: &str) -> Option<Header<'_>> {
    let rest = raw.strip_prefix('[')?;
    let (time, rest) = rest.split_once("] [")?;
    let (thread_level, rest) = rest.split_once(']')?;
    // Thread names may contain '/', the level never does.
    let (thread, level) = thread_level.rsplit_once('/')?;

    let (logger, rest) = match rest.strip_prefix(" [") {
        Some(after) => {
            let (logger, rest) = after.split_once(']')?;
            (Some(logger.trim_end_matches('/')), rest)
        }
        None => (None, rest),
    };

    let message = rest.strip_prefix(':')?;
    let message = message.strip_prefix(' ').unwrap_or(message);

    Some(Header {
        time,
        thread,
        level,
        logger,
        message,
    })
}

/// Read the last `n` lines of a file.
///
/// A missing file yields an empty list. Invalid UTF-8 is replaced with
/// U+FFFD rather than rejected, since crash output is not always clean.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn tail_last_lines(path: &Path, n: usize) -> anyhow::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open log file {}", path.display()))
        }
    };

    let mut reader = BufReader::new(file);
    let mut ring: VecDeque<String> = VecDeque::with_capacity(n.min(4096));
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let bytes_read = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("failed to read line from {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        if ring.len() == n {
            ring.pop_front();
        }
        ring.push_back(decode_line(&buf));
    }

    Ok(ring.into_iter().collect())
}

/// Follows one log file, returning only lines appended since the last poll.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    /// Bytes of a line whose newline has not been written yet.
    partial: Vec<u8>,
    /// Set while skipping the remainder of an oversized line.
    oversized: bool,
}

impl LogTailer {
    /// Follow `path` from its first byte.
    pub fn from_start(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: Vec::new(),
            oversized: false,
        }
    }

    /// Follow `path` from its current end, ignoring existing content.
    ///
    /// A missing file starts at offset zero so that everything written once
    /// it appears is seen.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but its metadata cannot be read.
    pub fn from_end(path: PathBuf) -> anyhow::Result<Self> {
        let offset = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read metadata for {}", path.display()))
            }
        };
        Ok(Self {
            path,
            offset,
            partial: Vec::new(),
            oversized: false,
        })
    }

    /// Path being followed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Return complete lines appended since the previous poll.
    ///
    /// A trailing line without a newline is held back until it is completed.
    /// If the file shrank below the tracked offset it is treated as rotated
    /// and read again from the start.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be opened or read.
    pub fn poll(&mut self) -> anyhow::Result<Vec<LogLine>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open log file {}", self.path.display()))
            }
        };

        let file_len = file
            .metadata()
            .with_context(|| format!("failed to read metadata for {}", self.path.display()))?
            .len();

        if file_len < self.offset {
            debug!(
                path = %self.path.display(),
                offset = self.offset,
                len = file_len,
                "log shrank, assuming rotation"
            );
            self.offset = 0;
            self.partial.clear();
            self.oversized = false;
        }

        if file_len == self.offset {
            return Ok(Vec::new());
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(self.offset))
            .with_context(|| format!("failed to seek in log file {}", self.path.display()))?;

        let mut lines = Vec::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let bytes_read = reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("failed to read line from {}", self.path.display()))?;
            if bytes_read == 0 {
                break;
            }
            self.offset = self
                .offset
                .saturating_add(u64::try_from(bytes_read).unwrap_or(u64::MAX));

            let complete = buf.last() == Some(&b'\n');

            if self.oversized {
                if complete {
                    self.oversized = false;
                }
                continue;
            }

            self.partial.extend_from_slice(&buf);
            if self.partial.len() > MAX_LINE_LEN {
                debug!(path = %self.path.display(), "discarding oversized log line");
                self.partial.clear();
                self.oversized = !complete;
                continue;
            }

            if !complete {
                break;
            }

            let line = std::mem::take(&mut self.partial);
            lines.push(LogLine::parse(&decode_line(&line)));
        }

        Ok(lines)
    }
}

/// Strip the line terminator and decode lossily.
fn decode_line(bytes: &[u8]) -> String {
    let trimmed = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    String::from_utf8_lossy(trimmed).into_owned()
}
