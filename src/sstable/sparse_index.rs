//! Sparse key → offset index over an SSTable's lines.
//!
//! Lines are grouped into chunks of at most `segment_size` bytes (a single
//! line larger than the budget forms a chunk of its own). The first key of
//! every chunk is recorded with the byte offset at which that chunk starts.
//!
//! The same [`SparseIndexBuilder`] is fed while writing a table and while
//! rescanning one on open, so both paths produce identical boundaries for
//! identical content.

use std::collections::BTreeMap;
use std::ops::Bound;

/// Incrementally records chunk boundaries as lines are appended in order.
#[derive(Debug)]
pub struct SparseIndexBuilder {
    segment_size: usize,
    /// Bytes accumulated in the current chunk.
    chunk: usize,
    /// Offset of the next line.
    offset: u64,
    entries: BTreeMap<String, u64>,
}

impl SparseIndexBuilder {
    pub fn new(segment_size: usize) -> Self {
        Self {
            segment_size,
            chunk: 0,
            offset: 0,
            entries: BTreeMap::new(),
        }
    }

    /// Accounts for one line of `line_len` bytes (newline included).
    pub fn add_line(&mut self, key: &str, line_len: usize) {
        if self.entries.is_empty() || self.chunk + line_len > self.segment_size {
            self.entries.insert(key.to_string(), self.offset);
            self.chunk = 0;
        }
        self.chunk += line_len;
        self.offset += line_len as u64;
    }

    pub fn finish(self) -> SparseIndex {
        SparseIndex {
            entries: self.entries,
            data_end: self.offset,
        }
    }
}

/// Immutable sparse index of one SSTable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseIndex {
    entries: BTreeMap<String, u64>,
    /// One past the last newline of the file.
    data_end: u64,
}

impl SparseIndex {
    /// Largest indexed key `<= key` and its chunk offset.
    pub fn find_segment(&self, key: &str) -> Option<(&str, u64)> {
        self.entries
            .range::<str, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(k, off)| (k.as_str(), *off))
    }

    /// Exclusive upper bound of the search range for `key`: the offset of the
    /// smallest indexed key `> key`, or the end of the last complete line.
    pub fn high_entry(&self, key: &str) -> u64 {
        self.entries
            .range::<str, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map_or(self.data_end, |(_, off)| *off)
    }

    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Indexed `(key, offset)` pairs in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.entries.iter().map(|(k, off)| (k.as_str(), *off))
    }
}
