//! Crash and warning signature matching for server log lines.
//!
//! Each [`Pattern`] is a named regular expression searched anywhere in the
//! raw line. User patterns from the config run first, followed by a small
//! set of builtin signatures for common Minecraft/Cobblemon failure modes.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Severity level for a detected signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Information only, no action needed.
    Low,
    /// May need attention soon.
    #[default]
    Medium,
    /// Needs attention now.
    High,
    /// Server is down or at risk.
    Critical,
}

impl Severity {
    /// Return a numeric rank for sorting (higher = more severe).
    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    /// Lowercase name as used in config files and notes.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named detection pattern as written in the config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    /// Human-readable name, also used as the incident title.
    pub name: String,
    /// Regular expression searched anywhere in the line.
    #[serde(rename = "match")]
    pub regex: String,
    /// How severe a match is.
    #[serde(default)]
    pub severity: Severity,
}

impl Pattern {
    /// Build a pattern from its parts.
    pub fn new(name: &str, regex: &str, severity: Severity) -> Self {
        Self {
            name: name.to_owned(),
            regex: regex.to_owned(),
            severity,
        }
    }
}

/// Errors produced while compiling patterns.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// A pattern has an empty name.
    #[error("pattern #{index} has an empty name")]
    EmptyName {
        /// Zero-based position in the pattern list.
        index: usize,
    },

    /// A pattern's regular expression failed to compile.
    #[error("pattern '{name}' has an invalid regex: {source}")]
    InvalidRegex {
        /// Pattern name.
        name: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },
}

/// A line that matched a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    /// Name of the matching pattern.
    pub pattern: String,
    /// Severity of the matching pattern.
    pub severity: Severity,
    /// The matching line without its trailing newline.
    pub line: String,
    /// Zero-based index of the line within the scanned batch.
    pub line_index: usize,
}

#[derive(Debug)]
struct CompiledPattern {
    name: String,
    severity: Severity,
    regex: Regex,
}

/// A compiled, ordered set of patterns.
#[derive(Debug)]
pub struct Classifier {
    patterns: Vec<CompiledPattern>,
}

impl Classifier {
    /// Compile the given patterns, preserving their order.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first pattern with an empty name or an
    /// invalid regular expression.
    pub fn new(patterns: &[Pattern]) -> Result<Self, ClassifierError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for (index, pattern) in patterns.iter().enumerate() {
            if pattern.name.trim().is_empty() {
                return Err(ClassifierError::EmptyName { index });
            }
            let regex =
                Regex::new(&pattern.regex).map_err(|source| ClassifierError::InvalidRegex {
                    name: pattern.name.clone(),
                    source,
                })?;
            compiled.push(CompiledPattern {
                name: pattern.name.clone(),
                severity: pattern.severity,
                regex,
            });
        }
        Ok(Self { patterns: compiled })
    }

    /// Compile user patterns followed by the builtins (when enabled).
    ///
    /// A builtin is dropped when a user pattern already uses its name, so a
    /// config can override a builtin signature.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern fails to compile.
    pub fn with_builtins(user: &[Pattern], builtins_enabled: bool) -> Result<Self, ClassifierError> {
        let mut all = user.to_vec();
        if builtins_enabled {
            all.extend(
                builtin_patterns()
                    .into_iter()
                    .filter(|b| !user.iter().any(|u| u.name == b.name)),
            );
        }
        Self::new(&all)
    }

    /// Number of compiled patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Names of the compiled patterns, in evaluation order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.name.as_str())
    }

    /// Match every line against every pattern.
    ///
    /// Hits are ordered by line, then by pattern order; a line matching
    /// several patterns yields several hits.
    pub fn find_matches<I, S>(&self, lines: I) -> Vec<Hit>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hits = Vec::new();
        for (line_index, line) in lines.into_iter().enumerate() {
            let line = line.as_ref().trim_end_matches(['\n', '\r']);
            for pattern in &self.patterns {
                if pattern.regex.is_match(line) {
                    hits.push(Hit {
                        pattern: pattern.name.clone(),
                        severity: pattern.severity,
                        line: line.to_owned(),
                        line_index,
                    });
                }
            }
        }
        hits
    }
}

/// Pick the hit that names an incident: the most severe, earliest first.
pub fn primary_hit(hits: &[Hit]) -> Option<&Hit> {
    hits.iter().fold(None, |best: Option<&Hit>, hit| match best {
        Some(b) if b.severity.rank() >= hit.severity.rank() => Some(b),
        _ => Some(hit),
    })
}

/// Builtin signatures for common server failure modes.
pub fn builtin_patterns() -> Vec<Pattern> {
    vec![
        Pattern::new(
            "Server crash",
            r"---- Minecraft Crash Report ----|This crash report has been saved to",
            Severity::Critical,
        ),
        Pattern::new(
            "Watchdog stall",
            r"A single server tick took [0-9.]+ seconds|Considering it to be crashed",
            Severity::Critical,
        ),
        Pattern::new(
            "Out of memory",
            r"java\.lang\.OutOfMemoryError",
            Severity::Critical,
        ),
        Pattern::new(
            "Tick loop exception",
            r"Encountered an unexpected exception|Exception in server tick loop",
            Severity::High,
        ),
        Pattern::new(
            "Port bind failure",
            r"FAILED TO BIND TO PORT|Address already in use",
            Severity::High,
        ),
        Pattern::new(
            "Mod loading failure",
            r"(?i)mod loading has failed|ModLoadingException|Incompatible mods? found",
            Severity::High,
        ),
        Pattern::new(
            "Cobblemon error",
            r"(?i)\[cobblemon[^\]]*\].*(?:error|exception)|/ERROR\] \[cobblemon",
            Severity::Medium,
        ),
        Pattern::new(
            "Tick lag",
            r"Can't keep up! Is the server overloaded\?",
            Severity::Low,
        ),
    ]
}
