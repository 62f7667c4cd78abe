use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::sstable::{self, SSTable, SSTableOptions, SstWriter};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small chunks so modest tables span many index segments.
pub fn small_options() -> SSTableOptions {
    SSTableOptions {
        segment_size: 64,
        probe_window_size: 64,
    }
}

/// `key_00000 .. key_{n-1}` with values `value_<i>`.
pub fn numbered(n: usize) -> Vec<(String, String)> {
    (0..n)
        .map(|i| (format!("key_{i:05}"), format!("value_{i}")))
        .collect()
}

/// Writes `records` (already sorted) as table `seq` inside `dir`.
pub fn write_table(
    dir: &Path,
    seq: u64,
    records: &[(String, String)],
    options: SSTableOptions,
) -> SSTable {
    init_tracing();
    let path = dir.join(sstable::file_name(seq));
    let mut writer = SstWriter::create(&path, options).unwrap();
    for (k, v) in records {
        writer.add(k, v).unwrap();
    }
    writer.finish().unwrap()
}
