//! Sorted String Table (SSTable) Module
//!
//! An immutable, memory-mapped text file of ascending `"key: value"` lines,
//! identified by a monotonic sequence number embedded in its file name
//! (`sstable<N>.txt`). Tombstoned keys are stored with the literal
//! [`TOMBSTONE`] value so that they shadow older tables until compaction
//! drops them.
//!
//! # On-disk layout
//!
//! ```text
//! apple: red
//! banana: TOMBSTONE
//! cherry: dark red
//! ```
//!
//! There is no header, footer, or persisted index. Both acceleration
//! structures are rebuilt in memory:
//!
//! - [`SparseIndex`]: first key of every `segment_size` chunk → chunk offset.
//! - [`BloomFilter`]: fixed 224,668-bit filter with 10 hash functions.
//!
//! They are built incrementally by [`SstWriter`] at flush/compaction time and
//! by a single linear rescan in [`SSTable::open`] at recovery time, using the
//! same chunking rule, so the results are identical for identical content.
//!
//! # Point lookup
//!
//! 1. Bloom filter check; a negative answer skips the file with no I/O.
//! 2. [`SparseIndex::find_segment`] gives the floor chunk offset `lo`.
//! 3. [`SparseIndex::high_entry`] gives the exclusive bound `hi`.
//! 4. Line-aligned binary search over `[lo, hi)`: each probe reads a window
//!    of `probe_window_size` bytes, aligns to the next line start, parses the
//!    line and narrows the range.
//!
//! A probe window without a newline, or a line without a `": "` separator,
//! is reported as an error instead of being masked.
//!
//! # Concurrency model
//!
//! Tables are immutable once renamed into place. Readers share them through
//! `Arc<SSTable>`; the mapping stays valid even after compaction unlinks the
//! file.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod bloom;
pub mod builder;
pub mod sparse_index;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Re-exports
// ------------------------------------------------------------------------------------------------

pub use bloom::BloomFilter;
pub use builder::SstWriter;
pub use sparse_index::{SparseIndex, SparseIndexBuilder};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    cmp::Ordering,
    ffi::OsString,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::memtable::TOMBSTONE;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const FILE_PREFIX: &str = "sstable";
const FILE_SUFFIX: &str = ".txt";
const TMP_SUFFIX: &str = ".tmp";

/// Separator between key and value on every line.
pub const KV_SEPARATOR: &str = ": ";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, rescan).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A line is not valid UTF-8.
    #[error("Invalid UTF-8 at offset {offset}")]
    InvalidUtf8 { offset: u64 },

    /// A probe window or trailing fragment contains no line terminator.
    #[error("No newline within {window} bytes at offset {offset}")]
    MissingNewline { offset: u64, window: usize },

    /// A line lacks the `": "` separator.
    #[error("Malformed line at offset {offset}")]
    MalformedLine { offset: u64 },

    /// File name does not follow `sstable<N>.txt`.
    #[error("Invalid SSTable file name: {0}")]
    InvalidFileName(String),
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// `sstable<seq>.txt`
pub fn file_name(seq: u64) -> String {
    format!("{FILE_PREFIX}{seq}{FILE_SUFFIX}")
}

/// Parses the sequence number out of `sstable<seq>.txt`.
pub fn parse_seq(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Temporary path a table is written to before being renamed to `path`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

/// Whether `name` is a leftover temporary table file.
pub fn is_tmp_name(name: &str) -> bool {
    name.ends_with(TMP_SUFFIX)
}

// ------------------------------------------------------------------------------------------------
// Options / results
// ------------------------------------------------------------------------------------------------

/// Layout parameters shared by writers and readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SSTableOptions {
    /// Chunk budget of the sparse index, in bytes.
    pub segment_size: usize,
    /// Bytes examined per binary-search probe. Must exceed the longest line.
    pub probe_window_size: usize,
}

impl Default for SSTableOptions {
    fn default() -> Self {
        Self {
            segment_size: 10 * 1024,
            probe_window_size: 1024,
        }
    }
}

/// Result of a single-table point lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetResult<'a> {
    Put(&'a str),
    /// The table holds a tombstone for the key.
    Delete,
    NotFound,
}

/// Length of a stored line, newline included.
pub(crate) fn line_len(key: &str, value: &str) -> usize {
    key.len() + KV_SEPARATOR.len() + value.len() + 1
}

/// Splits a line (without its newline) into key and value.
pub(crate) fn parse_record(line: &[u8], offset: u64) -> Result<(&str, &str), SSTableError> {
    let line = std::str::from_utf8(line).map_err(|_| SSTableError::InvalidUtf8 { offset })?;
    line.split_once(KV_SEPARATOR)
        .ok_or(SSTableError::MalformedLine { offset })
}

// ------------------------------------------------------------------------------------------------
// SSTable reader
// ------------------------------------------------------------------------------------------------

/// An open, immutable SSTable with its in-memory index and filter.
#[derive(Debug)]
pub struct SSTable {
    name: String,
    seq: u64,
    path: PathBuf,
    /// `None` for an empty file, which cannot be mapped.
    mmap: Option<Mmap>,
    index: SparseIndex,
    bloom: BloomFilter,
    size: u64,
    options: SSTableOptions,
}

impl SSTable {
    /// Opens a table and rebuilds its sparse index and bloom filter with one
    /// linear scan over the file.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::InvalidFileName`] if the name is not `sstable<N>.txt`.
    /// - [`SSTableError::MalformedLine`] / [`SSTableError::InvalidUtf8`] for a
    ///   corrupt line.
    /// - [`SSTableError::MissingNewline`] if the file ends with a partial line.
    pub fn open(path: impl AsRef<Path>, options: SSTableOptions) -> Result<Self, SSTableError> {
        let path = path.as_ref();
        let (name, seq) = Self::name_and_seq(path)?;
        let mmap = map_file(path)?;
        let bytes: &[u8] = mmap.as_deref().unwrap_or(&[]);

        let mut index = SparseIndexBuilder::new(options.segment_size);
        let mut bloom = BloomFilter::new();
        for record in Records::new(bytes) {
            let (offset, key, value) = record?;
            trace!("rescan {} @{}: {}", name, offset, key);
            index.add_line(key, line_len(key, value));
            bloom.add(key);
        }
        let index = index.finish();

        debug!(
            "Opened SSTable {} ({} bytes, {} index entries)",
            name,
            bytes.len(),
            index.len()
        );

        let size = bytes.len() as u64;
        Ok(Self {
            name,
            seq,
            path: path.to_path_buf(),
            mmap,
            index,
            bloom,
            size,
            options,
        })
    }

    /// Maps a freshly written table whose index and filter were built while
    /// writing it.
    pub(crate) fn from_parts(
        path: &Path,
        index: SparseIndex,
        bloom: BloomFilter,
        options: SSTableOptions,
    ) -> Result<Self, SSTableError> {
        let (name, seq) = Self::name_and_seq(path)?;
        let mmap = map_file(path)?;
        let size = mmap.as_ref().map_or(0, |m| m.len() as u64);
        Ok(Self {
            name,
            seq,
            path: path.to_path_buf(),
            mmap,
            index,
            bloom,
            size,
            options,
        })
    }

    /// Moves the table's file to `path`, taking the name and sequence number
    /// encoded there. The existing mapping stays valid.
    pub(crate) fn rename(mut self, path: &Path) -> Result<Self, SSTableError> {
        let (name, seq) = Self::name_and_seq(path)?;
        fs::rename(&self.path, path)?;
        debug!("Renamed SSTable {} -> {}", self.name, name);
        self.name = name;
        self.seq = seq;
        self.path = path.to_path_buf();
        Ok(self)
    }

    fn name_and_seq(path: &Path) -> Result<(String, u64), SSTableError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SSTableError::InvalidFileName(path.display().to_string()))?;
        let seq = parse_seq(name).ok_or_else(|| SSTableError::InvalidFileName(name.to_string()))?;
        Ok((name.to_string(), seq))
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes at open time.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn index(&self) -> &SparseIndex {
        &self.index
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    pub fn might_contain(&self, key: &str) -> bool {
        self.bloom.might_contain(key)
    }

    /// All `(key, value)` records in file order, tombstones included.
    pub fn records(&self) -> impl Iterator<Item = Result<(&str, &str), SSTableError>> + '_ {
        Records::new(self.bytes()).map(|r| r.map(|(_, k, v)| (k, v)))
    }

    /// Point lookup within this table alone.
    pub fn get(&self, key: &str) -> Result<GetResult<'_>, SSTableError> {
        if !self.bloom.might_contain(key) {
            trace!("{}: bloom negative for {}", self.name, key);
            return Ok(GetResult::NotFound);
        }
        let Some((_, lo)) = self.index.find_segment(key) else {
            return Ok(GetResult::NotFound);
        };
        let hi = self.index.high_entry(key);

        Ok(match self.search(key, lo as usize, hi as usize)? {
            Some(TOMBSTONE) => GetResult::Delete,
            Some(value) => GetResult::Put(value),
            None => GetResult::NotFound,
        })
    }

    /// Line-aligned binary search over `[lo, hi)`. Both bounds are line starts.
    fn search(&self, key: &str, mut lo: usize, mut hi: usize) -> Result<Option<&str>, SSTableError> {
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mut start = if mid == lo {
                lo
            } else {
                self.next_line_start(mid - 1)?
            };
            if start >= hi {
                start = lo;
            }

            let (line_key, value, line_len) = self.line_at(start)?;
            match line_key.cmp(key) {
                Ordering::Equal => return Ok(Some(value)),
                Ordering::Less => lo = start + line_len,
                Ordering::Greater => hi = start,
            }
        }
        Ok(None)
    }

    /// Probe window starting at `at`, clipped to the end of the file.
    fn window(&self, at: usize) -> &[u8] {
        let bytes = self.bytes();
        let end = at.saturating_add(self.options.probe_window_size).min(bytes.len());
        bytes.get(at..end).unwrap_or(&[])
    }

    /// Offset just past the first newline at or after `at`.
    fn next_line_start(&self, at: usize) -> Result<usize, SSTableError> {
        match self.window(at).iter().position(|&b| b == b'\n') {
            Some(pos) => Ok(at + pos + 1),
            None => Err(self.missing_newline(at)),
        }
    }

    /// Parses the line starting at `at`; returns key, value, and length
    /// including the newline.
    fn line_at(&self, at: usize) -> Result<(&str, &str, usize), SSTableError> {
        let window = self.window(at);
        let Some(nl) = window.iter().position(|&b| b == b'\n') else {
            return Err(self.missing_newline(at));
        };
        let (key, value) = parse_record(&window[..nl], at as u64)?;
        Ok((key, value, nl + 1))
    }

    fn missing_newline(&self, at: usize) -> SSTableError {
        SSTableError::MissingNewline {
            offset: at as u64,
            window: self.options.probe_window_size,
        }
    }
}

fn map_file(path: &Path) -> Result<Option<Mmap>, SSTableError> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    // SAFETY: table files are never modified after being renamed into place;
    // compaction replaces them by rename, which leaves existing mappings intact.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(mmap))
}

// ------------------------------------------------------------------------------------------------
// Records iterator
// ------------------------------------------------------------------------------------------------

/// Iterates `(offset, key, value)` over complete lines. A trailing fragment
/// without a newline yields [`SSTableError::MissingNewline`] and ends the
/// iteration.
struct Records<'a> {
    bytes: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> Records<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(u64, &'a str, &'a str), SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.bytes.len() {
            return None;
        }
        let offset = self.pos;
        let rest = &self.bytes[offset..];
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            self.done = true;
            return Some(Err(SSTableError::MissingNewline {
                offset: offset as u64,
                window: rest.len(),
            }));
        };
        self.pos = offset + nl + 1;
        match parse_record(&rest[..nl], offset as u64) {
            Ok((key, value)) => Some(Ok((offset as u64, key, value))),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
