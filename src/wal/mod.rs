//! Write-Ahead Logging (WAL) Module
//!
//! A durable, append-only, line-oriented log of every mutation applied to the
//! live memtable. The log and the memtable form one unit: both are cleared
//! together when the memtable is flushed, and replaying the log into an empty
//! memtable reproduces the pre-crash state exactly.
//!
//! # On-disk layout
//!
//! ```text
//! 0, INSERT: apple: red
//! 22, UPDATE: apple: green
//! 47, DELETE: apple: TOMBSTONE
//! ```
//!
//! Each line is `"<offset>, <OP>: <key>: <value>\n"` where `offset` is the
//! byte position at which the line starts. Offsets restart at `0` after
//! [`Wal::clear`] and keep growing across reopen, so they stay strictly
//! increasing for the lifetime of one log.
//!
//! # Guarantees
//!
//! - **Durability:** every append is followed by [`File::sync_data`] before it
//!   returns, so an acknowledged mutation survives a crash.
//! - **Torn tails:** a trailing partial line left by a crash is cut off when
//!   the log is reopened, so later appends never fuse with it.
//! - **Lenient replay:** unknown operation tokens and malformed lines are
//!   logged and skipped; they never abort recovery.
//!
//! Concurrency is the caller's concern: the engine holds its write lock across
//! WAL append and memtable mutation.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{error, info, trace, warn};

use crate::memtable::TOMBSTONE;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// Mutation kind recorded in a WAL line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Insert,
    Update,
    Delete,
}

impl WalOp {
    /// Token written to disk.
    pub fn as_str(self) -> &'static str {
        match self {
            WalOp::Insert => "INSERT",
            WalOp::Update => "UPDATE",
            WalOp::Delete => "DELETE",
        }
    }

    /// Parses an on-disk token. Unknown tokens yield `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "INSERT" => Some(WalOp::Insert),
            "UPDATE" => Some(WalOp::Update),
            "DELETE" => Some(WalOp::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for WalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded WAL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub offset: u64,
    pub op: WalOp,
    pub key: String,
    pub value: String,
}

/// Outcome counters of a replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Lines decoded into entries.
    pub applied: usize,
    /// Lines skipped because of an unknown token or a malformed layout.
    pub skipped: usize,
}

/// Why a line could not be decoded.
enum LineFault {
    UnknownOp(String),
    Malformed,
}

/// Decodes `"<offset>, <OP>: <key>: <value>"` (no trailing newline).
fn parse_line(line: &str) -> Result<WalEntry, LineFault> {
    let (offset, rest) = line.split_once(", ").ok_or(LineFault::Malformed)?;
    let offset = offset.parse::<u64>().map_err(|_| LineFault::Malformed)?;

    let (token, rest) = rest.split_once(": ").ok_or(LineFault::Malformed)?;
    let op = WalOp::from_token(token).ok_or_else(|| LineFault::UnknownOp(token.to_string()))?;

    let (key, value) = rest.split_once(": ").ok_or(LineFault::Malformed)?;
    if key.is_empty() || value.is_empty() {
        return Err(LineFault::Malformed);
    }

    Ok(WalEntry {
        offset,
        op,
        key: key.to_string(),
        value: value.to_string(),
    })
}

// ------------------------------------------------------------------------------------------------
// Wal
// ------------------------------------------------------------------------------------------------

/// Append-only mutation log at a fixed path.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    /// Byte position of the next line; equals the file length.
    offset: u64,
}

impl Wal {
    /// Opens or creates the log at `path`.
    ///
    /// An existing log keeps its content. A trailing partial line is truncated
    /// away and the next offset continues from the resulting file length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut len = file.metadata()?.len();
        if len > 0 {
            let bytes = fs::read(&path)?;
            let complete = bytes
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |pos| pos as u64 + 1);
            if complete < len {
                warn!(
                    "Truncating torn WAL tail at {} ({} trailing bytes)",
                    path.display(),
                    len - complete
                );
                file.set_len(complete)?;
                file.sync_data()?;
                len = complete;
            }
        }

        info!("Opened WAL file at {} (offset={})", path.display(), len);

        Ok(Self {
            path,
            file,
            offset: len,
        })
    }

    pub fn write_insert(&mut self, key: &str, value: &str) -> Result<u64, WalError> {
        self.append(WalOp::Insert, key, value)
    }

    pub fn write_update(&mut self, key: &str, value: &str) -> Result<u64, WalError> {
        self.append(WalOp::Update, key, value)
    }

    /// Records a deletion. The value column always carries the tombstone.
    pub fn write_delete(&mut self, key: &str) -> Result<u64, WalError> {
        self.append(WalOp::Delete, key, TOMBSTONE)
    }

    /// Appends one line and forces it to stable storage.
    ///
    /// Returns the offset at which the line was written.
    pub fn append(&mut self, op: WalOp, key: &str, value: &str) -> Result<u64, WalError> {
        let at = self.offset;
        let line = format!("{at}, {op}: {key}: {value}\n");

        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        self.offset += line.len() as u64;

        trace!("WAL append at {}: {} {}", at, op, key);
        Ok(at)
    }

    /// Reads every line from the start of the file, in order.
    pub fn replay(&self) -> Result<(Vec<WalEntry>, ReplayStats), WalError> {
        info!("Starting WAL replay from file: {}", self.path.display());

        let bytes = fs::read(&self.path)?;
        let mut entries = Vec::new();
        let mut stats = ReplayStats::default();

        for (lineno, raw) in bytes.split(|&b| b == b'\n').enumerate() {
            if raw.is_empty() {
                continue;
            }
            let Ok(line) = std::str::from_utf8(raw) else {
                warn!("Skipping non-UTF-8 WAL line {}", lineno + 1);
                stats.skipped += 1;
                continue;
            };
            match parse_line(line) {
                Ok(entry) => {
                    entries.push(entry);
                    stats.applied += 1;
                }
                Err(LineFault::UnknownOp(token)) => {
                    warn!("Unrecognized WAL operation {:?} on line {}", token, lineno + 1);
                    stats.skipped += 1;
                }
                Err(LineFault::Malformed) => {
                    warn!("Skipping malformed WAL line {}: {:?}", lineno + 1, line);
                    stats.skipped += 1;
                }
            }
        }

        info!(
            "WAL replay finished: {} applied, {} skipped",
            stats.applied, stats.skipped
        );
        Ok((entries, stats))
    }

    /// Truncates the log to zero length and resets the offset counter.
    pub fn clear(&mut self) -> Result<(), WalError> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        self.offset = 0;
        info!("Cleared WAL file: {}", self.path.display());
        Ok(())
    }

    /// Offset the next append will be written at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.file.sync_all() {
            error!("Failed to sync WAL on drop: {}", e);
        }
    }
}
