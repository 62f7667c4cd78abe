//! # tierkv
//!
//! A single-node, embeddable key-value store built on a
//! **Log-Structured Merge Tree** with size-tiered compaction. Records are
//! plain UTF-8 text on disk: a line-oriented write-ahead log and sorted
//! `key: value` SSTable files.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tierkv::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! db.insert("hello", "world").unwrap();
//! assert_eq!(db.read("hello").unwrap(), Some("world".to_string()));
//!
//! db.update("hello", "there").unwrap();
//! db.delete("hello").unwrap();
//! assert_eq!(db.read("hello").unwrap(), None);
//!
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Write-ahead logging**: every mutation is synced to `log.txt` before it is acknowledged.
//! - **Sparse index + bloom filter** per SSTable for cheap negative lookups.
//! - **Size-tiered compaction** in four fixed buckets, run on a background pool.
//! - **Crash recovery**: WAL replay plus a rescan of the SSTable directory.
//!
//! ## On-disk layout
//!
//! ```text
//! <dir>/log.txt               0, INSERT: apple: red
//! <dir>/sstable/sstable1.txt  apple: red
//! <dir>/sstable/sstable2.txt  ...
//! ```

pub(crate) mod compaction;
pub(crate) mod engine;
pub(crate) mod memtable;
pub(crate) mod sstable;
pub(crate) mod wal;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use engine::{Engine, EngineConfig};
use thiserror::Error;
use tracing::{debug, error, info};

pub use engine::{EngineError, EngineStats, RecoveryReport};
pub use memtable::TOMBSTONE;
pub use wal::ReplayStats;

/// Delimiters the text formats split on; never allowed inside keys or values.
const FORBIDDEN_SEQUENCES: [&str; 4] = [": ", ", ", "\n", "\r"];

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// The configuration is validated when passed to [`Db::open`].
///
/// # Example
///
/// ```rust
/// use tierkv::DbConfig;
///
/// let config = DbConfig {
///     write_buffer_size: 64 * 1024,
///     thread_pool_size: 2,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Unflushed key + value bytes that trigger a memtable flush.
    ///
    /// Default: 16 KiB. Must be ≥ 64.
    pub write_buffer_size: usize,

    /// Byte budget of one sparse index chunk inside an SSTable.
    ///
    /// Default: 10 KiB. Must be ≥ 64.
    pub segment_size: usize,

    /// A size bucket is compacted once it holds *more* than this many tables.
    ///
    /// Default: 5. Must be ≥ 2.
    pub compaction_threshold: usize,

    /// Bytes read per binary-search probe. Also caps the length of one
    /// stored record line.
    ///
    /// Default: 1024. Must be ≥ 16.
    pub probe_window_size: usize,

    /// Number of background compaction threads.
    ///
    /// Default: 1. Must be ≥ 1.
    pub thread_pool_size: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            write_buffer_size: engine.write_buffer_size,
            segment_size: engine.segment_size,
            compaction_threshold: engine.compaction_threshold,
            probe_window_size: engine.probe_window_size,
            thread_pool_size: 1,
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.write_buffer_size < 64 {
            return Err(DbError::InvalidConfig(
                "write_buffer_size must be >= 64".into(),
            ));
        }
        if self.segment_size < 64 {
            return Err(DbError::InvalidConfig("segment_size must be >= 64".into()));
        }
        if self.compaction_threshold < 2 {
            return Err(DbError::InvalidConfig(
                "compaction_threshold must be >= 2".into(),
            ));
        }
        if self.probe_window_size < 16 {
            return Err(DbError::InvalidConfig(
                "probe_window_size must be >= 16".into(),
            ));
        }
        if self.thread_pool_size < 1 {
            return Err(DbError::InvalidConfig(
                "thread_pool_size must be >= 1".into(),
            ));
        }
        Ok(())
    }

    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            write_buffer_size: self.write_buffer_size,
            segment_size: self.segment_size,
            compaction_threshold: self.compaction_threshold,
            probe_window_size: self.probe_window_size,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key or value constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Argument validation
// ------------------------------------------------------------------------------------------------

fn check_text(what: &str, text: &str) -> Result<(), DbError> {
    if text.is_empty() {
        return Err(DbError::InvalidArgument(format!("{what} must not be empty")));
    }
    if let Some(seq) = FORBIDDEN_SEQUENCES.iter().find(|s| text.contains(*s)) {
        return Err(DbError::InvalidArgument(format!(
            "{what} must not contain {seq:?}"
        )));
    }
    Ok(())
}

/// Checks a record before it reaches the WAL.
///
/// `value` is `None` for deletes; the stored line then carries [`TOMBSTONE`].
fn validate_record(key: &str, value: Option<&str>, probe_window: usize) -> Result<(), DbError> {
    check_text("key", key)?;
    if let Some(value) = value {
        check_text("value", value)?;
        if value == TOMBSTONE {
            return Err(DbError::InvalidArgument(format!(
                "value {TOMBSTONE:?} is reserved"
            )));
        }
    }

    let line_len = sstable::line_len(key, value.unwrap_or(TOMBSTONE));
    if line_len > probe_window {
        return Err(DbError::InvalidArgument(format!(
            "record line of {line_len} bytes exceeds probe window of {probe_window} bytes"
        )));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

/// Holds the thread pool sender and worker handles.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Box<dyn FnOnce() + Send>>,
    workers: Vec<thread::JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// `Db` is `Send + Sync`; share it across threads via `Arc<Db>`.
///
/// # Background compaction
///
/// Flushes happen inline on the write that fills the buffer. That write
/// then hands one compaction pass to the background pool, so the caller
/// never waits on a merge.
///
/// # Shutdown
///
/// Call [`Db::close`] for a graceful shutdown. Dropping the handle without
/// closing performs the same steps but discards errors.
pub struct Db {
    engine: Engine,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
    probe_window_size: usize,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dir", &self.engine.data_dir())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database at the given directory and recovers
    /// any state left by a previous run.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any configuration parameter
    /// is out of range.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;

        let pool_size = config.thread_pool_size;
        let engine = Engine::open(&path, config.to_engine_config())?;

        let (sender, receiver) = crossbeam::channel::unbounded::<Box<dyn FnOnce() + Send>>();

        let mut workers = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("tierkv-compact-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .map_err(EngineError::from)?;
            workers.push(handle);
        }
        // Workers hold their own receiver clones.
        drop(receiver);

        info!(path = %path.as_ref().display(), pool_size, "database opened");

        Ok(Self {
            engine,
            bg: Mutex::new(Some(BackgroundPool { sender, workers })),
            closed: AtomicBool::new(false),
            probe_window_size: config.probe_window_size,
        })
    }

    /// Gracefully shuts down the database.
    ///
    /// Waits for queued compaction passes, then syncs the data directories.
    /// Subsequent operations return [`DbError::Closed`]. Calling `close`
    /// more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown_pool();
        self.engine.close()?;

        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts a key. Overwrites the value if the key is still buffered in
    /// memory.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if the key or value is empty,
    /// contains `": "`, `", "` or a line break, if the value is the reserved
    /// [`TOMBSTONE`] literal, or if the record would not fit in one probe
    /// window.
    pub fn insert(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.check_open()?;
        validate_record(key, Some(value), self.probe_window_size)?;

        if self.engine.insert(key, value)? {
            self.schedule_compaction();
        }
        Ok(())
    }

    /// Overwrites a key, inserting it when absent.
    ///
    /// Same argument rules as [`Db::insert`].
    pub fn update(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.check_open()?;
        validate_record(key, Some(value), self.probe_window_size)?;

        if self.engine.update(key, value)? {
            self.schedule_compaction();
        }
        Ok(())
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: &str) -> Result<(), DbError> {
        self.check_open()?;
        validate_record(key, None, self.probe_window_size)?;

        if self.engine.delete(key)? {
            self.schedule_compaction();
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Returns the value of `key`, or `None` if it was never written or has
    /// been deleted.
    pub fn read(&self, key: &str) -> Result<Option<String>, DbError> {
        self.check_open()?;
        check_text("key", key)?;

        Ok(self.engine.read(key)?)
    }

    pub fn stats(&self) -> Result<EngineStats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Forces the memtable to disk. Returns `false` if it was empty.
    pub fn flush(&self) -> Result<bool, DbError> {
        self.check_open()?;
        let flushed = self.engine.flush()?;
        if flushed {
            self.schedule_compaction();
        }
        Ok(flushed)
    }

    /// Runs one compaction pass on the calling thread and returns the number
    /// of merges performed.
    pub fn compact(&self) -> Result<usize, DbError> {
        self.check_open()?;
        Ok(self.engine.compact_if_needed()?)
    }

    /// Discards in-memory state and rebuilds it from the WAL and the
    /// SSTable directory.
    pub fn recover(&self) -> Result<RecoveryReport, DbError> {
        self.check_open()?;
        Ok(self.engine.recover()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    /// Queues one compaction pass on the background pool.
    fn schedule_compaction(&self) {
        let guard = self.bg.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bg) = guard.as_ref() {
            let engine = self.engine.clone();
            let _ = bg.sender.send(Box::new(move || {
                match engine.compact_if_needed() {
                    Ok(0) => {}
                    Ok(merges) => debug!(merges, "background: compaction pass"),
                    Err(e) => error!("background compaction failed: {e}"),
                }
            }));
        }
    }

    /// Drains the background task queue and joins all worker threads.
    fn shutdown_pool(&self) {
        let pool = self
            .bg
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(bg) = pool {
            // Dropping the sender lets workers drain the queue and exit.
            drop(bg.sender);
            for worker in bg.workers {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown_pool();
            let _ = self.engine.close();
        }
    }
}
