use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::compaction::{CompactionManager, CompactionOutcome};
use crate::sstable::{self, SSTable, SSTableOptions, SstWriter};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn options() -> SSTableOptions {
    SSTableOptions {
        segment_size: 256,
        probe_window_size: 256,
    }
}

/// Writes table `seq` from `(key, value)` pairs, sorting them first.
pub fn table(dir: &Path, seq: u64, records: &[(&str, &str)]) -> Arc<SSTable> {
    init_tracing();
    let mut sorted = records.to_vec();
    sorted.sort();
    let mut writer = SstWriter::create(dir.join(sstable::file_name(seq)), options()).unwrap();
    for (k, v) in sorted {
        writer.add(k, v).unwrap();
    }
    Arc::new(writer.finish().unwrap())
}

/// All records of a table as owned pairs.
pub fn contents(table: &SSTable) -> Vec<(String, String)> {
    table
        .records()
        .map(|r| {
            let (k, v) = r.unwrap();
            (k.to_string(), v.to_string())
        })
        .collect()
}

/// Plans, runs, and installs one pass, dropping failed merges.
pub fn run_pass(manager: &mut CompactionManager) -> Vec<CompactionOutcome> {
    let outcomes: Vec<CompactionOutcome> = manager
        .plan()
        .into_iter()
        .filter_map(|task| task.run().ok())
        .collect();
    for outcome in &outcomes {
        manager.install(outcome);
    }
    outcomes
}
