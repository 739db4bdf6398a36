//! Shared fixtures for cleaner integration tests.

use std::sync::Arc;

use tempfile::TempDir;
use umbra_cleaner::{CleanerConfig, DatabaseId, Environment};

/// Installs a fmt subscriber honoring `RUST_LOG`; repeated calls are fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small files and immediate utilization flushing, so tests control file
/// boundaries precisely.
pub fn test_config() -> CleanerConfig {
    CleanerConfig {
        log_file_max: 1 << 16,
        bytes_interval: 1,
        ..CleanerConfig::default()
    }
}

pub fn create_env(config: CleanerConfig) -> (TempDir, Arc<Environment>) {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let env = Environment::create(dir.path(), config).expect("environment");
    (dir, env)
}

/// The logical node id currently backing `key`.
pub fn node_id_of(env: &Environment, db: DatabaseId, key: &[u8]) -> u64 {
    let location = env
        .tree()
        .locate_parent_slot(db, key, None, 0)
        .expect("key indexed");
    let state = location.bin.latch();
    state.slots[location.index].node_id
}
