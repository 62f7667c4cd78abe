//! # LSM Storage Engine
//!
//! Orchestrates the memtable, the write-ahead log, the SSTable registry, and
//! the compaction manager behind a cloneable [`Engine`] handle.
//!
//! ## Write path
//!
//! 1. Append the mutation to the WAL (synced before returning).
//! 2. Apply it to the memtable.
//! 3. Adjust the unflushed byte counter by the change in key + value bytes.
//! 4. Once the counter reaches [`EngineConfig::write_buffer_size`], flush the
//!    memtable to `sstable<N>.txt`, register it, then clear the WAL and
//!    memtable together.
//!
//! ## Read path
//!
//! Memtable first; a tombstone there is a definitive miss. Otherwise the
//! registry is snapshotted newest-first and each table is probed in turn.
//! The first table holding the key decides: a live value is returned, a
//! tombstone ends the search as not-found.
//!
//! ## Concurrency Model
//!
//! | Lock | Guards |
//! |------|--------|
//! | `pass: Mutex<()>` | one compaction pass or recovery at a time |
//! | `state: RwLock<WriteState>` | memtable, WAL, unflushed counter, next sequence number |
//! | `compaction: Mutex<CompactionManager>` | size buckets; held only to plan or install a merge |
//! | `registry: RwLock<Registry>` | name → table map |
//!
//! Locks are always taken in the order pass → state → compaction → registry.
//! A compaction pass never takes the state lock, and merges run with only
//! the pass lock held, so flushes and reads proceed during merge I/O.
//! Mutations hold the state write guard across WAL append, memtable update,
//! and any inline flush, so the WAL and the memtable never diverge. Readers
//! take the state read guard, check the memtable, clone the registry snapshot,
//! and release everything before touching disk.
//!
//! ## Recovery
//!
//! [`Engine::open`] calls [`Engine::recover`]: the WAL is replayed into a
//! fresh memtable, leftover `*.tmp` files are removed, and every
//! `sstable<N>.txt` is reopened with a full rescan. Files that fail to open
//! are logged and skipped.

mod registry;

#[cfg(test)]
mod tests;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::compaction::{self, CompactionError, CompactionManager, CompactionOutcome, NUM_BUCKETS};
use crate::memtable::{Memtable, MemtableGetResult, TOMBSTONE};
use crate::sstable::{self, GetResult, SSTable, SSTableError, SSTableOptions, SstWriter};
use crate::wal::{ReplayStats, Wal, WalError, WalOp};

use registry::Registry;

/// WAL file name inside the data directory.
pub const WAL_FILE: &str = "log.txt";

/// SSTable directory inside the data directory.
pub const SSTABLE_DIR: &str = "sstable";

/// Sequence number given to the first SSTable of an empty directory.
const FIRST_SEQ: u64 = 1;

// ------------------------------------------------------------------------------------------------
// Errors / config / stats
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unflushed key + value bytes that trigger a memtable flush.
    pub write_buffer_size: usize,

    /// Sparse index chunk budget, in bytes.
    pub segment_size: usize,

    /// Bucket member count that must be exceeded to compact that bucket.
    pub compaction_threshold: usize,

    /// Bytes read per binary-search probe.
    pub probe_window_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 16 * 1024,
            segment_size: 10 * 1024,
            compaction_threshold: compaction::DEFAULT_COMPACTION_THRESHOLD,
            probe_window_size: 1024,
        }
    }
}

impl EngineConfig {
    pub fn sstable_options(&self) -> SSTableOptions {
        SSTableOptions {
            segment_size: self.segment_size,
            probe_window_size: self.probe_window_size,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub memtable_entries: usize,
    /// Key + value bytes held by the memtable.
    pub unflushed_bytes: usize,
    pub sstable_count: usize,
    /// Members per size bucket.
    pub bucket_sizes: [usize; NUM_BUCKETS],
    /// Registered table names, newest first.
    pub sstable_names: Vec<String>,
}

/// What [`Engine::recover`] found on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub replay: ReplayStats,
    pub sstables_loaded: usize,
    pub sstables_skipped: usize,
    pub tmp_files_removed: usize,
}

// ------------------------------------------------------------------------------------------------
// Engine state
// ------------------------------------------------------------------------------------------------

/// Everything a mutation touches, guarded as one unit.
struct WriteState {
    memtable: Memtable,
    wal: Wal,
    /// Key + value bytes applied since the last flush.
    unflushed: usize,
    next_seq: u64,
}

struct EngineInner {
    pass: Mutex<()>,
    state: RwLock<WriteState>,
    compaction: Mutex<CompactionManager>,
    registry: RwLock<Registry>,
    data_dir: PathBuf,
    sstable_dir: PathBuf,
    config: EngineConfig,
}

/// The main LSM storage engine handle.
///
/// Thread-safe; clones share the same state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn lock_pass(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.inner
            .pass
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, WriteState>, EngineError> {
        self.inner
            .state
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, WriteState>, EngineError> {
        self.inner
            .state
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn lock_compaction(&self) -> Result<MutexGuard<'_, CompactionManager>, EngineError> {
        self.inner
            .compaction
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))
    }

    fn read_registry(&self) -> Result<RwLockReadGuard<'_, Registry>, EngineError> {
        self.inner
            .registry
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn write_registry(&self) -> Result<RwLockWriteGuard<'_, Registry>, EngineError> {
        self.inner
            .registry
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) an engine rooted at `path` and recovers its state.
    ///
    /// Creates `path/` and `path/sstable/` when missing, opens `path/log.txt`,
    /// then runs [`Engine::recover`].
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let data_dir = path.as_ref().to_path_buf();
        let sstable_dir = data_dir.join(SSTABLE_DIR);
        fs::create_dir_all(&sstable_dir)?;

        let wal = Wal::open(data_dir.join(WAL_FILE))?;

        let inner = EngineInner {
            pass: Mutex::new(()),
            state: RwLock::new(WriteState {
                memtable: Memtable::new(),
                wal,
                unflushed: 0,
                next_seq: FIRST_SEQ,
            }),
            compaction: Mutex::new(CompactionManager::new(
                config.compaction_threshold,
                config.sstable_options(),
            )),
            registry: RwLock::new(Registry::default()),
            data_dir,
            sstable_dir,
            config,
        };

        let engine = Self {
            inner: Arc::new(inner),
        };
        engine.recover()?;
        Ok(engine)
    }

    /// Rebuilds all in-memory state from disk.
    ///
    /// 1. Replay the WAL, in file order, into a fresh memtable.
    /// 2. Remove leftover `*.tmp` files from the SSTable directory.
    /// 3. Reopen every `sstable<N>.txt`, rebuilding its index and filter.
    /// 4. Rebuild the registry and the compaction buckets.
    ///
    /// Unreadable tables are logged and skipped. Waits for any running
    /// compaction pass to finish first.
    pub fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let _pass = self.lock_pass()?;
        let mut state = self.write_state()?;
        let mut report = RecoveryReport::default();

        // 1. WAL → memtable
        let (entries, replay) = state.wal.replay()?;
        let mut memtable = Memtable::new();
        for entry in &entries {
            match entry.op {
                WalOp::Insert => memtable.insert(&entry.key, &entry.value),
                WalOp::Update => memtable.update(&entry.key, &entry.value),
                WalOp::Delete => memtable.delete(&entry.key),
            }
        }
        state.unflushed = memtable.payload_bytes();
        state.memtable = memtable;
        report.replay = replay;

        // 2-3. Directory rescan
        let mut tables = Vec::new();
        for entry in fs::read_dir(&self.inner.sstable_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if sstable::is_tmp_name(name) {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        report.tmp_files_removed += 1;
                        info!(name, "recovery: removed leftover temp file");
                    }
                    Err(e) => warn!(name, error = %e, "recovery: failed to remove temp file"),
                }
                continue;
            }
            if sstable::parse_seq(name).is_none() {
                debug!(name, "recovery: ignoring unrelated file");
                continue;
            }

            match SSTable::open(&path, self.inner.config.sstable_options()) {
                Ok(table) => tables.push(Arc::new(table)),
                Err(e) => {
                    report.sstables_skipped += 1;
                    warn!(name, error = %e, "recovery: skipping unreadable SSTable");
                }
            }
        }
        tables.sort_by_key(|t| t.seq());
        report.sstables_loaded = tables.len();

        // 4. Buckets + registry
        let mut manager = self.lock_compaction()?;
        let mut registry = self.write_registry()?;
        manager.clear();
        registry.clear();
        for table in tables {
            if let Err(e) = manager.add_sstable(Arc::clone(&table)) {
                warn!(name = table.name(), error = %e, "recovery: table not bucketed");
            }
            registry.insert(table);
        }
        state.next_seq = registry.max_seq().map_or(FIRST_SEQ, |s| s + 1);

        info!(
            wal_applied = report.replay.applied,
            wal_skipped = report.replay.skipped,
            memtable_entries = state.memtable.len(),
            sstables = report.sstables_loaded,
            skipped = report.sstables_skipped,
            next_seq = state.next_seq,
            "recovery complete"
        );
        Ok(report)
    }

    /// Syncs the data directories. All writes are already durable; this
    /// makes the latest renames and unlinks durable as well.
    pub fn close(&self) -> Result<(), EngineError> {
        let _state = self.write_state()?;
        for dir in [&self.inner.sstable_dir, &self.inner.data_dir] {
            if let Ok(handle) = fs::File::open(dir) {
                handle.sync_all()?;
            }
        }
        info!(dir = %self.inner.data_dir.display(), "engine closed");
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    /// Inserts `key`. Behaves as [`Engine::update`] when the key is already
    /// in the memtable.
    ///
    /// Returns `Ok(true)` if the write triggered a flush.
    pub fn insert(&self, key: &str, value: &str) -> Result<bool, EngineError> {
        let mut state = self.write_state()?;
        trace!(key, value_len = value.len(), "engine insert");
        if state.memtable.find_key(key) {
            return self.apply_update(&mut state, key, value);
        }
        self.apply_insert(&mut state, key, value)
    }

    /// Overwrites `key`. Behaves as [`Engine::insert`] when the key is not in
    /// the memtable.
    pub fn update(&self, key: &str, value: &str) -> Result<bool, EngineError> {
        let mut state = self.write_state()?;
        trace!(key, value_len = value.len(), "engine update");
        if state.memtable.find_key(key) {
            return self.apply_update(&mut state, key, value);
        }
        self.apply_insert(&mut state, key, value)
    }

    /// Records a tombstone for `key`, whether or not it is in the memtable.
    pub fn delete(&self, key: &str) -> Result<bool, EngineError> {
        let mut state = self.write_state()?;
        trace!(key, "engine delete");

        let old_len = state.memtable.find_value(key).map(str::len);
        state.wal.write_delete(key)?;
        state.memtable.delete(key);
        state.unflushed = match old_len {
            Some(old) => (state.unflushed + TOMBSTONE.len()).saturating_sub(old),
            None => state.unflushed + key.len() + TOMBSTONE.len(),
        };
        self.maybe_flush(&mut state)
    }

    fn apply_insert(
        &self,
        state: &mut WriteState,
        key: &str,
        value: &str,
    ) -> Result<bool, EngineError> {
        state.wal.write_insert(key, value)?;
        state.memtable.insert(key, value);
        state.unflushed += key.len() + value.len();
        self.maybe_flush(state)
    }

    fn apply_update(
        &self,
        state: &mut WriteState,
        key: &str,
        value: &str,
    ) -> Result<bool, EngineError> {
        let old_len = state.memtable.find_value(key).map_or(0, str::len);
        state.wal.write_update(key, value)?;
        state.memtable.update(key, value);
        state.unflushed = (state.unflushed + value.len()).saturating_sub(old_len);
        self.maybe_flush(state)
    }

    fn maybe_flush(&self, state: &mut WriteState) -> Result<bool, EngineError> {
        if state.unflushed < self.inner.config.write_buffer_size {
            return Ok(false);
        }
        self.flush_locked(state)
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Forces the memtable to a new SSTable. Returns `Ok(false)` when the
    /// memtable is empty.
    pub fn flush(&self) -> Result<bool, EngineError> {
        let mut state = self.write_state()?;
        self.flush_locked(&mut state)
    }

    /// Writes the memtable as `sstable<next_seq>.txt`, registers it, then
    /// clears the WAL and the memtable as one unit.
    fn flush_locked(&self, state: &mut WriteState) -> Result<bool, EngineError> {
        if state.memtable.is_empty() {
            return Ok(false);
        }

        let seq = state.next_seq;
        let path = self.inner.sstable_dir.join(sstable::file_name(seq));
        let mut writer = SstWriter::create(&path, self.inner.config.sstable_options())?;
        for (key, value) in state.memtable.iter_sorted() {
            writer.add(key, value)?;
        }
        let table = Arc::new(writer.finish()?);
        state.next_seq += 1;

        if let Ok(dir) = fs::File::open(&self.inner.sstable_dir) {
            dir.sync_all()?;
        }

        {
            let mut manager = self.lock_compaction()?;
            let bucket = manager.add_sstable(Arc::clone(&table))?;
            self.write_registry()?.insert(Arc::clone(&table));
            debug!(name = table.name(), bucket, "flush: table registered");
        }

        let entries = state.memtable.len();
        state.wal.clear()?;
        state.memtable.clear();
        state.unflushed = 0;

        info!(
            name = table.name(),
            entries,
            size = table.size(),
            "memtable flushed"
        );
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Looks up `key`.
    ///
    /// Returns `Ok(None)` when the key was never written or its newest
    /// version is a tombstone, in the memtable or in any SSTable.
    pub fn read(&self, key: &str) -> Result<Option<String>, EngineError> {
        trace!(key, "engine read");

        let snapshot = {
            let state = self.read_state()?;
            match state.memtable.get(key) {
                MemtableGetResult::Put(value) => return Ok(Some(value.to_string())),
                MemtableGetResult::Delete => return Ok(None),
                MemtableGetResult::NotFound => {}
            }
            self.read_registry()?.snapshot()
        };

        for table in &snapshot {
            match table.get(key)? {
                GetResult::Put(value) => {
                    trace!(key, table = table.name(), "read: hit");
                    return Ok(Some(value.to_string()));
                }
                GetResult::Delete => {
                    trace!(key, table = table.name(), "read: tombstone");
                    return Ok(None);
                }
                GetResult::NotFound => {}
            }
        }
        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Runs one compaction pass and applies every merge to the registry.
    ///
    /// Inputs are picked under the compaction lock, merged with it released,
    /// and installed under it again. A failed merge is logged and leaves its
    /// bucket untouched; other buckets still proceed.
    ///
    /// Returns the number of merges performed.
    pub fn compact_if_needed(&self) -> Result<usize, EngineError> {
        let _pass = self.lock_pass()?;
        let tasks = self.lock_compaction()?.plan();
        if tasks.is_empty() {
            return Ok(0);
        }

        let mut merged = 0;
        for task in tasks {
            let bucket = task.bucket;
            match task.run() {
                Ok(outcome) => {
                    self.install(&outcome)?;
                    merged += 1;
                }
                Err(e) => warn!(bucket, error = %e, "compaction: bucket skipped"),
            }
        }
        info!(merged, "compaction: pass complete");
        Ok(merged)
    }

    fn install(&self, outcome: &CompactionOutcome) -> Result<(), EngineError> {
        let mut manager = self.lock_compaction()?;
        manager.install(outcome);

        let mut registry = self.write_registry()?;
        for name in &outcome.removed {
            registry.remove(name);
        }
        registry.insert(Arc::clone(&outcome.output));
        debug!(
            output = outcome.output.name(),
            sstables = registry.len(),
            "compaction applied to registry"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Stats
    // --------------------------------------------------------------------------------------------

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let state = self.read_state()?;
        let bucket_sizes = self.lock_compaction()?.bucket_sizes();
        let snapshot = self.read_registry()?.snapshot();

        Ok(EngineStats {
            memtable_entries: state.memtable.len(),
            unflushed_bytes: state.unflushed,
            sstable_count: snapshot.len(),
            bucket_sizes,
            sstable_names: snapshot.iter().map(|t| t.name().to_string()).collect(),
        })
    }
}
