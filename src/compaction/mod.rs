//! # Compaction Module
//!
//! Size-tiered compaction over four fixed buckets:
//!
//! | Bucket | File size            |
//! |--------|----------------------|
//! | 0      | `[0, 30 KiB)`        |
//! | 1      | `[30 KiB, 60 KiB)`   |
//! | 2      | `[60 KiB, 120 KiB)`  |
//! | 3      | `[120 KiB, ∞)`       |
//!
//! Every registered SSTable sits in exactly one bucket, chosen by its on-disk
//! size. [`CompactionManager::plan`] looks at every bucket whose member count
//! exceeds the threshold and picks exactly the two oldest members (lowest
//! sequence numbers) of each such bucket.
//!
//! ## Merge rules
//!
//! - Two-way sorted merge by key.
//! - On a key present in both inputs, the newer input's value wins.
//! - A tombstone is dropped unless an older live table outside the pair may
//!   still hold its key, in which case it is written through.
//!
//! The output replaces the older input's file first and is then renamed over
//! the newer input's file, so it inherits the newer input's name and
//! sequence number. A merged table whose new size crosses a bucket boundary
//! moves to that bucket; any cascade is left to the next pass.
//!
//! ## Phases
//!
//! A pass is split so the manager is only locked for bookkeeping:
//!
//! 1. [`CompactionManager::plan`] snapshots the inputs as [`CompactionTask`]s.
//! 2. [`CompactionTask::run`] does all file I/O without touching the manager.
//! 3. [`CompactionManager::install`] swaps the inputs for the output.
//!
//! Tables registered between planning and installing are left alone. The
//! manager does not own the engine's table registry; each
//! [`CompactionOutcome`] is also applied to the registry by the caller.

pub mod merge;

#[cfg(test)]
mod tests;

use std::{fs, io, sync::Arc};

use thiserror::Error;
use tracing::{debug, info};

use crate::sstable::{SSTable, SSTableError, SSTableOptions};

pub use merge::{MergeStats, merge_tables};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Number of size buckets.
pub const NUM_BUCKETS: usize = 4;

/// Exclusive upper bounds of buckets `0..NUM_BUCKETS - 1`.
pub const BUCKET_LIMITS: [u64; NUM_BUCKETS - 1] = [30 * 1024, 60 * 1024, 120 * 1024];

/// Default member count a bucket must exceed before it is compacted.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 5;

// ------------------------------------------------------------------------------------------------
// Error / result types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The two inputs picked for one bucket, plus what the merge must consult.
#[derive(Debug)]
pub struct CompactionTask {
    pub bucket: usize,
    pub older: Arc<SSTable>,
    pub newer: Arc<SSTable>,
    /// Every other table older than `newer`, from any bucket.
    deeper: Vec<Arc<SSTable>>,
    options: SSTableOptions,
}

/// One completed two-way merge.
#[derive(Debug)]
pub struct CompactionOutcome {
    pub bucket: usize,
    /// Names of both inputs, older first. Both leave the registry.
    pub removed: [String; 2],
    /// The merged table, installed under the newer input's name.
    pub output: Arc<SSTable>,
    pub stats: MergeStats,
}

impl CompactionTask {
    /// Merges the two inputs on disk.
    pub fn run(self) -> Result<CompactionOutcome, CompactionError> {
        debug!(
            bucket = self.bucket,
            older = self.older.name(),
            newer = self.newer.name(),
            deeper = self.deeper.len(),
            "compaction: merging"
        );

        let (output, stats) = merge_tables(&self.older, &self.newer, &self.deeper, self.options)?;

        Ok(CompactionOutcome {
            bucket: self.bucket,
            removed: [self.older.name().to_string(), self.newer.name().to_string()],
            output: Arc::new(output),
            stats,
        })
    }
}

/// Bucket index for a file of `size` bytes.
pub fn bucket_for_size(size: u64) -> usize {
    BUCKET_LIMITS
        .iter()
        .position(|&limit| size < limit)
        .unwrap_or(NUM_BUCKETS - 1)
}

// ------------------------------------------------------------------------------------------------
// CompactionManager
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub struct CompactionManager {
    buckets: [Vec<Arc<SSTable>>; NUM_BUCKETS],
    threshold: usize,
    options: SSTableOptions,
}

impl CompactionManager {
    pub fn new(threshold: usize, options: SSTableOptions) -> Self {
        Self {
            buckets: Default::default(),
            threshold,
            options,
        }
    }

    /// Measures the table's on-disk size and appends it to the matching
    /// bucket. Returns the bucket index.
    pub fn add_sstable(&mut self, table: Arc<SSTable>) -> Result<usize, CompactionError> {
        let size = fs::metadata(table.path())?.len();
        let bucket = bucket_for_size(size);
        debug!(name = table.name(), size, bucket, "compaction: table added");
        self.buckets[bucket].push(table);
        Ok(bucket)
    }

    /// Removes a table by name from whichever bucket holds it.
    pub fn remove_sstable(&mut self, name: &str) -> bool {
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.iter().position(|t| t.name() == name) {
                bucket.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn bucket_sizes(&self) -> [usize; NUM_BUCKETS] {
        std::array::from_fn(|i| self.buckets[i].len())
    }

    pub fn bucket(&self, index: usize) -> &[Arc<SSTable>] {
        self.buckets.get(index).map_or(&[], |b| b.as_slice())
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Picks the merge for every due bucket.
    ///
    /// The set of due buckets is fixed here. Each task holds its inputs, so
    /// the manager may keep changing while the tasks run.
    pub fn plan(&self) -> Vec<CompactionTask> {
        let due: Vec<usize> = (0..NUM_BUCKETS)
            .filter(|&b| self.buckets[b].len() > self.threshold)
            .collect();
        if due.is_empty() {
            return Vec::new();
        }

        info!(?due, sizes = ?self.bucket_sizes(), "compaction: pass starting");

        due.into_iter()
            .filter_map(|bucket| self.plan_bucket(bucket))
            .collect()
    }

    fn plan_bucket(&self, bucket: usize) -> Option<CompactionTask> {
        let mut members: Vec<&Arc<SSTable>> = self.buckets[bucket].iter().collect();
        if members.len() < 2 {
            return None;
        }
        members.sort_by_key(|t| t.seq());
        let older = Arc::clone(members[0]);
        let newer = Arc::clone(members[1]);

        let deeper = self
            .buckets
            .iter()
            .flatten()
            .filter(|t| t.seq() < newer.seq() && t.seq() != older.seq())
            .cloned()
            .collect();

        Some(CompactionTask {
            bucket,
            older,
            newer,
            deeper,
            options: self.options,
        })
    }

    /// Replaces a merge's inputs with its output. Returns the output's bucket.
    pub fn install(&mut self, outcome: &CompactionOutcome) -> usize {
        for name in &outcome.removed {
            self.remove_sstable(name);
        }
        let output = &outcome.output;
        // Files are already swapped; fall back to the mapped size.
        let size = fs::metadata(output.path()).map_or(output.size(), |m| m.len());
        let target = bucket_for_size(size);
        self.buckets[target].push(Arc::clone(output));

        info!(
            bucket = outcome.bucket,
            target,
            output = output.name(),
            written = outcome.stats.written,
            dropped_tombstones = outcome.stats.dropped_tombstones,
            kept_tombstones = outcome.stats.kept_tombstones,
            sizes = ?self.bucket_sizes(),
            "compaction: merged two tables"
        );
        target
    }
}
