//! Cleaner configuration options.

use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::log::HEADER_BYTES;

/// Clustering policy for opportunistic migration.
///
/// When a leaf index page is about to be written out, entries whose log
/// records sit in low-utilization files can be migrated alongside it so
/// related records end up physically close in the current file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterMode {
    /// No clustering migration.
    #[default]
    Off,
    /// Cluster only records that are resident in memory.
    Resident,
    /// Cluster regardless of residency (forces fetches).
    All,
}

/// How the whole-environment advisory lock behaves during file deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvLockMode {
    /// Take an exclusive `fs2` advisory lock on the environment lock file;
    /// deletion is skipped when other processes hold the environment open.
    #[default]
    Advisory,
    /// Never lock; deletion proceeds unconditionally. Single-process
    /// deployments only.
    Disabled,
}

/// Options controlling cleaning behavior and the log layer it runs over.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Buffer size used for sequential file scans during cleaning.
    pub read_buffer_size: usize,
    /// Utilization threshold in `[0, 1]`; files below it become cleaning
    /// candidates.
    pub min_utilization: f64,
    /// Physically delete cleaned files when true; rename them with a
    /// `.del` suffix when false.
    pub expunge: bool,
    /// Clustering policy for lazy migration.
    pub cluster: ClusterMode,
    /// Maximum files cleaned in one multi-file batch; `0` means no limit.
    pub max_batch_files: usize,
    /// Capacity (entries) of the per-pass look-ahead cache.
    pub look_ahead_cache_size: usize,
    /// Bytes of tracked utilization change accumulated before flushing
    /// into the profile; `0` selects `log_file_max / 4`.
    pub bytes_interval: u64,
    /// Upper bound on waiting for shared metadata (database registry)
    /// while cleaning; expiry defers the record to a later pass.
    pub lock_timeout: Duration,
    /// Size at which the current log file is rolled over.
    pub log_file_max: u64,
    /// Validate checksums on random entry reads (always on for cleaning
    /// scans and end-of-log probes).
    pub checksum_on_read: bool,
    /// Environment lock strategy used before deleting files.
    pub env_lock: EnvLockMode,
    /// Fsync the log file after every append.
    pub fsync: bool,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8192,
            min_utilization: 0.5,
            expunge: true,
            cluster: ClusterMode::Off,
            max_batch_files: 0,
            look_ahead_cache_size: 64,
            bytes_interval: 0,
            lock_timeout: Duration::from_millis(500),
            log_file_max: 1 << 20,
            checksum_on_read: true,
            env_lock: EnvLockMode::Advisory,
            fsync: false,
        }
    }
}

impl CleanerConfig {
    /// Validates option ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_utilization) {
            return Err(EngineError::InvalidArgument(format!(
                "min_utilization must be within [0, 1], got {}",
                self.min_utilization
            )));
        }
        if self.read_buffer_size < HEADER_BYTES {
            return Err(EngineError::InvalidArgument(
                "read_buffer_size smaller than a log entry header".into(),
            ));
        }
        if self.log_file_max < HEADER_BYTES as u64 * 2 {
            return Err(EngineError::InvalidArgument(
                "log_file_max too small to hold a file header entry".into(),
            ));
        }
        Ok(())
    }

    /// The byte interval actually used for deferred utilization flushing.
    pub fn effective_bytes_interval(&self) -> u64 {
        if self.bytes_interval > 0 {
            self.bytes_interval
        } else {
            self.log_file_max / 4
        }
    }
}
