//! SSTable writer: streams sorted records into a new table file.
//!
//! Records are appended as `"key: value\n"` lines. While writing, every key
//! is added to a fresh [`BloomFilter`] and every line is fed to a
//! [`SparseIndexBuilder`], so the finished table needs no rescan.
//!
//! # Atomicity
//!
//! 1. Write everything to `<path>.tmp`.
//! 2. Flush and sync the file.
//! 3. Rename `<path>.tmp` → `<path>`.
//!
//! A crash cannot leave a partially written table under its final name;
//! leftover `.tmp` files are removed on recovery.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{
    BloomFilter, KV_SEPARATOR, SSTable, SSTableError, SSTableOptions, SparseIndexBuilder, line_len,
    tmp_path,
};

/// Builds one SSTable file on disk.
///
/// # Example
///
/// ```rust,ignore
/// let mut writer = SstWriter::create(&path, options)?;
/// for (k, v) in memtable.iter_sorted() {
///     writer.add(k, v)?;
/// }
/// let table = writer.finish()?;
/// ```
pub struct SstWriter {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    index: SparseIndexBuilder,
    bloom: BloomFilter,
    options: SSTableOptions,
    records: usize,
    #[cfg(debug_assertions)]
    last_key: Option<String>,
}

impl SstWriter {
    /// Opens `<path>.tmp` for writing, truncating any stale temp file.
    pub fn create(path: impl AsRef<Path>, options: SSTableOptions) -> Result<Self, SSTableError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = tmp_path(&final_path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        Ok(Self {
            final_path,
            tmp_path,
            writer: BufWriter::new(file),
            index: SparseIndexBuilder::new(options.segment_size),
            bloom: BloomFilter::new(),
            options,
            records: 0,
            #[cfg(debug_assertions)]
            last_key: None,
        })
    }

    /// Appends one record. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &str, value: &str) -> Result<(), SSTableError> {
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.last_key.as_deref().is_none_or(|last| last < key),
                "keys must be strictly ascending"
            );
            self.last_key = Some(key.to_string());
        }

        self.writer.write_all(key.as_bytes())?;
        self.writer.write_all(KV_SEPARATOR.as_bytes())?;
        self.writer.write_all(value.as_bytes())?;
        self.writer.write_all(b"\n")?;

        self.index.add_line(key, line_len(key, value));
        self.bloom.add(key);
        self.records += 1;
        Ok(())
    }

    /// Records written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Syncs the temp file, renames it into place, and maps the result.
    pub fn finish(self) -> Result<SSTable, SSTableError> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| SSTableError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)?;

        debug!(
            "Wrote SSTable {} ({} records)",
            self.final_path.display(),
            self.records
        );

        SSTable::from_parts(
            &self.final_path,
            self.index.finish(),
            self.bloom,
            self.options,
        )
    }

    /// Removes the temp file without installing it.
    pub fn abandon(self) {
        let tmp = self.tmp_path.clone();
        drop(self);
        let _ = fs::remove_file(tmp);
    }
}
