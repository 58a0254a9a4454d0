//! Record sources — where each cycle's batch of raw lines comes from.
//!
//! In `Truncate` mode the live file is renamed before it is read, so
//! appenders that open the path afterwards start a fresh file. The renamed
//! file is re-read once more on the next cycle to pick up writes from
//! appenders that still had it open, then removed.

use std::ffi::OsString;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("record source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One cycle's worth of complete lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordBatch {
    pub lines: Vec<String>,
    /// Complete lines the source had to discard: not valid UTF-8, or left
    /// unterminated in a file that was already drained.
    pub rejected: u64,
}

impl RecordBatch {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            rejected: 0,
        }
    }
}

/// Produces one batch of complete lines per aggregation cycle.
///
/// A line is either entirely in the batch or not at all; implementations
/// must never hand over a partially written line.
pub trait RecordSource: Send {
    fn fetch(&mut self) -> Result<RecordBatch, SourceError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// What a [`FileSource`] does with lines once they are read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainMode {
    /// Leave the file alone; every cycle counts the whole file.
    #[default]
    Retain,
    /// Move the file aside before reading it; every cycle counts only lines
    /// appended since the previous one.
    Truncate,
}

/// A drained file kept for one more cycle, so appenders that opened it
/// before the rename can still finish their writes.
#[derive(Debug)]
struct Settling {
    path: PathBuf,
    /// Bytes already consumed.
    offset: u64,
    /// Unterminated tail at `offset`.
    pending: Vec<u8>,
}

/// Reads newline-terminated lines from a local file.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    mode: DrainMode,
    settling: Option<Settling>,
    /// Set once the live file has been moved aside at least once. From
    /// then on a missing live file just means nothing new was written.
    drained: bool,
    sequence: u64,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, mode: DrainMode) -> Self {
        Self {
            path: path.into(),
            mode,
            settling: None,
            drained: false,
            sequence: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> DrainMode {
        self.mode
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> SourceError {
        if source.kind() == ErrorKind::NotFound {
            SourceError::Unavailable(format!("{} does not exist", path.display()))
        } else {
            SourceError::Io {
                path: path.display().to_string(),
                source,
            }
        }
    }

    fn read_whole(&self) -> Result<RecordBatch, SourceError> {
        let content = std::fs::read(&self.path).map_err(|e| self.io_error(&self.path, e))?;
        let (complete, tail) = split_complete(&content);
        let batch = decode_lines(complete, &self.path);
        debug!(
            path = %self.path.display(),
            lines = batch.lines.len(),
            rejected = batch.rejected,
            pending_bytes = tail.len(),
            "read record batch"
        );
        Ok(batch)
    }

    /// Finish the previous drain, then move the live file aside and read it.
    fn drain(&mut self) -> Result<RecordBatch, SourceError> {
        let mut batch = RecordBatch::default();

        if let Some(settling) = &self.settling {
            let late = read_from(&settling.path, settling.offset)
                .map_err(|e| self.io_error(&settling.path, e))?;
            let mut bytes = settling.pending.clone();
            bytes.extend_from_slice(&late);

            let (complete, tail) = split_complete(&bytes);
            batch.extend(decode_lines(complete, &settling.path));
            if !tail.is_empty() {
                warn!(
                    path = %settling.path.display(),
                    bytes = tail.len(),
                    "dropping unterminated line from drained file"
                );
                batch.rejected += 1;
            }
            if let Err(e) = std::fs::remove_file(&settling.path) {
                warn!(path = %settling.path.display(), error = %e, "failed to remove drained file");
            }
            self.settling = None;
        }

        let staging = self.staging_path();
        match std::fs::rename(&self.path, &staging) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound && self.drained => {
                debug!(path = %self.path.display(), lines = batch.lines.len(), "no new records");
                return Ok(batch);
            }
            Err(e) => {
                let err = self.io_error(&self.path, e);
                if batch.lines.is_empty() && batch.rejected == 0 {
                    return Err(err);
                }
                // Hand over what the previous drain produced; retry next cycle.
                warn!(path = %self.path.display(), error = %err, "failed to move log file aside");
                return Ok(batch);
            }
        }
        self.drained = true;
        self.sequence += 1;
        // Recorded before reading so a failed read is retried from the start.
        self.settling = Some(Settling {
            path: staging.clone(),
            offset: 0,
            pending: Vec::new(),
        });

        let content = std::fs::read(&staging).map_err(|e| self.io_error(&staging, e))?;
        let (complete, tail) = split_complete(&content);
        batch.extend(decode_lines(complete, &staging));
        debug!(
            path = %self.path.display(),
            staging = %staging.display(),
            lines = batch.lines.len(),
            rejected = batch.rejected,
            pending_bytes = tail.len(),
            "drained record batch"
        );

        self.settling = Some(Settling {
            offset: content.len() as u64,
            pending: tail.to_vec(),
            path: staging,
        });
        Ok(batch)
    }

    /// `<file>.<epoch ms>-<n>.draining`, next to the live file so the
    /// rename stays on one filesystem.
    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        name.push(format!(".{}-{}.draining", epoch_millis(), self.sequence));
        self.path.with_file_name(name)
    }
}

impl RecordSource for FileSource {
    fn fetch(&mut self) -> Result<RecordBatch, SourceError> {
        match self.mode {
            DrainMode::Retain => self.read_whole(),
            DrainMode::Truncate => self.drain(),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

impl RecordBatch {
    fn extend(&mut self, other: RecordBatch) {
        self.lines.extend(other.lines);
        self.rejected += other.rejected;
    }
}

/// Split at the last newline: `(complete lines, unterminated tail)`.
fn split_complete(content: &[u8]) -> (&[u8], &[u8]) {
    match content.iter().rposition(|&b| b == b'\n') {
        Some(idx) => content.split_at(idx + 1),
        None => (&content[..0], content),
    }
}

/// Decode newline-terminated lines one by one. A line that is not valid
/// UTF-8 is dropped on its own.
fn decode_lines(complete: &[u8], path: &Path) -> RecordBatch {
    let mut batch = RecordBatch::default();
    let Some(body) = complete.strip_suffix(b"\n") else {
        return batch;
    };
    for (idx, raw) in body.split(|&b| b == b'\n').enumerate() {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        match std::str::from_utf8(raw) {
            Ok(line) => batch.lines.push(line.to_string()),
            Err(e) => {
                warn!(path = %path.display(), line = idx + 1, error = %e, "dropping line that is not valid UTF-8");
                batch.rejected += 1;
            }
        }
    }
    batch
}

fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Shared in-memory batch. Clones observe the same lines, so a test or a
/// one-shot caller can keep a handle while the collector owns another.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    lines: Arc<Mutex<Option<Vec<String>>>>,
}

impl MemorySource {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source = Self::default();
        source.set_lines(lines);
        source
    }

    /// A source whose every fetch fails until lines are set.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn set_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.lines.lock() = Some(lines.into_iter().map(Into::into).collect());
    }

    pub fn set_unavailable(&self) {
        *self.lines.lock() = None;
    }
}

impl RecordSource for MemorySource {
    fn fetch(&mut self) -> Result<RecordBatch, SourceError> {
        self.lines
            .lock()
            .clone()
            .map(RecordBatch::from_lines)
            .ok_or_else(|| SourceError::Unavailable("memory source has no batch".to_string()))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
