use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig, SSTABLE_DIR, WAL_FILE};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large buffer: nothing is flushed unless a test asks for it.
pub fn memtable_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        write_buffer_size: 64 * 1024,
        segment_size: 256,
        compaction_threshold: 5,
        probe_window_size: 256,
    }
}

/// 64-byte buffer: a handful of writes produce a new SSTable.
pub fn small_buffer_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        write_buffer_size: 64,
        segment_size: 64,
        compaction_threshold: 5,
        probe_window_size: 256,
    }
}

/// Like [`memtable_only_config`] but compacts once a bucket holds three tables.
pub fn eager_compaction_config() -> EngineConfig {
    EngineConfig {
        compaction_threshold: 2,
        ..memtable_only_config()
    }
}

pub fn reopen(path: &Path, config: EngineConfig) -> Engine {
    Engine::open(path, config).unwrap()
}

pub fn wal_len(dir: &Path) -> u64 {
    std::fs::metadata(dir.join(WAL_FILE)).unwrap().len()
}

/// File names in the SSTable directory, sorted.
pub fn sstable_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.join(SSTABLE_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
