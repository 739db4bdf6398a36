//! Garbage collection engine for the Umbra append-only log format.
//!
//! Data files are never updated in place: every write appends a log entry
//! to the current file and the superseded version stays on disk. The
//! cleaner tracks per-file utilization, migrates still-live records out of
//! poorly utilized files, and deletes those files once no live data and no
//! outstanding readers remain.

#![warn(missing_docs)]

pub mod cleaner;
pub mod config;
pub mod env;
pub mod error;
pub mod log;
pub mod stats;
pub mod tree;
pub mod txn;

pub use cleaner::Cleaner;
pub use config::{CleanerConfig, ClusterMode, EnvLockMode};
pub use env::Environment;
pub use error::{EngineError, Result};
pub use log::Lsn;
pub use tree::DatabaseId;
