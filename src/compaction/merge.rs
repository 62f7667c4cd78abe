//! Two-way merge of an older and a newer SSTable into one output table.

use std::cmp::Ordering;
use std::fs::File;
use std::iter::Peekable;
use std::path::Path;
use std::sync::Arc;

use tracing::trace;

use crate::memtable::TOMBSTONE;
use crate::sstable::{SSTable, SSTableError, SSTableOptions, SstWriter};

use super::CompactionError;

/// Counters reported by [`merge_tables`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records written to the output.
    pub written: usize,
    /// Keys present in both inputs (older value discarded).
    pub overwritten: usize,
    /// Tombstone records discarded.
    pub dropped_tombstones: usize,
    /// Tombstones written through because an older table may hold the key.
    pub kept_tombstones: usize,
}

/// Merges `older` and `newer` and installs the result under `newer`'s name.
///
/// `deeper` lists every other live table older than `newer`. A tombstone is
/// dropped only when none of their filters admits its key.
///
/// Installation is two renames, each atomic:
///
/// 1. `<older>.tmp` → `<older>`: the merged data replaces the older input.
///    `newer` is still on disk, so its tombstones keep shadowing.
/// 2. `<older>` → `<newer>`: the merged table takes the newer input's name
///    and sequence number.
///
/// A crash at any point leaves a set of files that reads the same as either
/// the inputs or the output.
pub fn merge_tables(
    older: &SSTable,
    newer: &SSTable,
    deeper: &[Arc<SSTable>],
    options: SSTableOptions,
) -> Result<(SSTable, MergeStats), CompactionError> {
    let (merged, stats) = write_over_older(older, newer, deeper, options)?;
    let merged = merged.rename(newer.path())?;
    sync_parent(merged.path())?;
    Ok((merged, stats))
}

/// First step of [`merge_tables`]: writes the merge to `<older>.tmp` and
/// renames it over `older`'s file. `newer`'s file is left untouched.
pub(crate) fn write_over_older(
    older: &SSTable,
    newer: &SSTable,
    deeper: &[Arc<SSTable>],
    options: SSTableOptions,
) -> Result<(SSTable, MergeStats), CompactionError> {
    let mut writer = SstWriter::create(older.path(), options)?;
    let mut stats = MergeStats::default();

    let result = write_merged(older, newer, deeper, &mut writer, &mut stats);
    if let Err(e) = result {
        writer.abandon();
        return Err(e);
    }

    let table = writer.finish()?;
    sync_parent(table.path())?;
    Ok((table, stats))
}

fn sync_parent(path: &Path) -> Result<(), CompactionError> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    if let Ok(handle) = File::open(dir) {
        handle.sync_all()?;
    }
    Ok(())
}

fn write_merged(
    older: &SSTable,
    newer: &SSTable,
    deeper: &[Arc<SSTable>],
    writer: &mut SstWriter,
    stats: &mut MergeStats,
) -> Result<(), CompactionError> {
    let mut old_iter = older.records().peekable();
    let mut new_iter = newer.records().peekable();

    loop {
        let order = match (peek_key(&mut old_iter)?, peek_key(&mut new_iter)?) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        };

        let (key, value) = match order {
            Ordering::Less => next_record(&mut old_iter)?,
            Ordering::Greater => next_record(&mut new_iter)?,
            Ordering::Equal => {
                next_record(&mut old_iter)?;
                stats.overwritten += 1;
                next_record(&mut new_iter)?
            }
        };

        if value == TOMBSTONE {
            if deeper.iter().any(|t| t.might_contain(key)) {
                trace!(key, "merge: keeping tombstone");
                stats.kept_tombstones += 1;
            } else {
                trace!(key, "merge: dropping tombstone");
                stats.dropped_tombstones += 1;
                continue;
            }
        }
        writer.add(key, value)?;
        stats.written += 1;
    }
    Ok(())
}

/// Key of the next record, surfacing a read error eagerly.
fn peek_key<'a, I>(iter: &mut Peekable<I>) -> Result<Option<&'a str>, CompactionError>
where
    I: Iterator<Item = Result<(&'a str, &'a str), SSTableError>>,
{
    match iter.peek() {
        None => Ok(None),
        Some(Ok((key, _))) => Ok(Some(*key)),
        Some(Err(_)) => match iter.next() {
            Some(Err(e)) => Err(e.into()),
            _ => Ok(None),
        },
    }
}

fn next_record<'a, I>(iter: &mut Peekable<I>) -> Result<(&'a str, &'a str), CompactionError>
where
    I: Iterator<Item = Result<(&'a str, &'a str), SSTableError>>,
{
    match iter.next() {
        Some(record) => Ok(record?),
        None => Err(CompactionError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "merge input exhausted",
        ))),
    }
}
