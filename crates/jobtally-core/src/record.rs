//! Record parser — one raw log line into a [`Record`].
//!
//! Line grammar: `host, job[, label_fragment]*`. Fields are comma-separated
//! with CSV-style double quoting. A fragment is a `key=value` or
//! `key:value` pair, optionally wrapped in `{...}` and optionally quoted;
//! one quoted field may carry several pairs.
//!
//! Malformed input never fails the caller: a bad line is dropped, a bad
//! fragment is dropped on its own, and both are logged and counted in
//! [`ParseStats`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::labels::{HOST_LABEL, JOB_LABEL};

/// One parsed occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub host: String,
    pub job: String,
    /// Well-formed extra labels only. Never contains `host` or `job`.
    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,
}

impl Record {
    pub fn new(host: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            job: job.into(),
            extra_labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_labels.insert(name.into(), value.into());
        self
    }
}

/// Per-batch parse counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseStats {
    /// Non-blank lines seen.
    pub lines: u64,
    /// Lines that produced a record.
    pub records: u64,
    /// Lines dropped for missing `host`/`job`.
    pub dropped_lines: u64,
    /// Label fragments dropped from otherwise valid lines.
    pub dropped_fragments: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
enum FragmentRejection {
    #[error("no '=' or ':' separator")]
    NoSeparator,
    #[error("empty label name")]
    EmptyName,
    #[error("empty value for label {0:?}")]
    EmptyValue(String),
    #[error("invalid label name {0:?}")]
    InvalidName(String),
    #[error("label {0:?} is reserved for the positional field")]
    Reserved(String),
}

/// Parse one raw line.
///
/// Returns `None` when the line is dropped. Whitespace-only lines are
/// skipped without a diagnostic and without touching `stats`.
pub fn parse_line(line: &str, stats: &mut ParseStats) -> Option<Record> {
    if line.trim().is_empty() {
        return None;
    }
    stats.lines += 1;

    let fields = split_fields(line);
    let host = unquote(fields[0]);
    let job = fields.get(1).map(|f| unquote(f)).unwrap_or_default();
    if host.is_empty() || job.is_empty() {
        warn!(line = %line.trim(), "dropping line without host and job");
        stats.dropped_lines += 1;
        return None;
    }

    let mut record = Record::new(host, job);
    for field in &fields[2..] {
        for fragment in split_fragments(field) {
            match parse_fragment(fragment) {
                Ok((name, value)) => {
                    record.extra_labels.insert(name, value);
                }
                Err(reason) => {
                    warn!(
                        host = %record.host,
                        job = %record.job,
                        fragment = %fragment,
                        %reason,
                        "dropping label fragment"
                    );
                    stats.dropped_fragments += 1;
                }
            }
        }
    }

    stats.records += 1;
    Some(record)
}

/// Split on commas that are not inside double quotes.
fn split_fields(line: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    fields.push(&line[start..]);
    fields
}

/// Break one field into candidate `key=value` pairs. Empty pieces (stray
/// braces, `""`, trailing commas) are skipped silently.
fn split_fragments(field: &str) -> impl Iterator<Item = &str> {
    strip_braces(strip_quotes(field.trim()))
        .split(',')
        .map(str::trim)
        .filter(|piece| !strip_braces(piece).is_empty())
}

fn parse_fragment(fragment: &str) -> Result<(String, String), FragmentRejection> {
    let fragment = strip_braces(fragment);
    let (name, value) = fragment
        .split_once(['=', ':'])
        .ok_or(FragmentRejection::NoSeparator)?;

    let name = unquote(name);
    let value = unquote(value);
    if name.is_empty() {
        return Err(FragmentRejection::EmptyName);
    }
    if value.is_empty() {
        return Err(FragmentRejection::EmptyValue(name));
    }
    if name == HOST_LABEL || name == JOB_LABEL {
        return Err(FragmentRejection::Reserved(name));
    }
    if !is_valid_label_name(&name) {
        return Err(FragmentRejection::InvalidName(name));
    }
    Ok((name, value))
}

fn is_quote(c: char) -> bool {
    matches!(c, '"' | '\'' | '\u{201c}' | '\u{201d}')
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches(is_quote).trim()
}

fn strip_braces(s: &str) -> &str {
    s.trim().trim_matches(['{', '}']).trim()
}

fn unquote(s: &str) -> String {
    strip_quotes(s.trim()).to_string()
}

/// Exposition label names: `[a-zA-Z_][a-zA-Z0-9_]*`, `__` prefix reserved.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__")
}
