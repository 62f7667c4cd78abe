use std::path::PathBuf;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fresh temp dir plus the WAL path inside it.
pub fn wal_path() -> (TempDir, PathBuf) {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("log.txt");
    (tmp, path)
}
