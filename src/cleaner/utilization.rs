//! Per-file utilization accounting.
//!
//! The profile is the durable view: total and obsolete bytes per file.
//! The tracker batches obsolescence deltas in memory and folds them into
//! the profile once enough bytes have accumulated, so hot write paths do
//! not contend on the profile lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

/// Byte and count totals for one log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    /// Bytes ever written to the file.
    pub total_bytes: u64,
    /// Bytes known obsolete.
    pub obsolete_bytes: u64,
    /// Entries known obsolete.
    pub obsolete_count: u64,
}

impl FileSummary {
    /// Fraction of the file still live, in `[0, 1]`. An empty file counts
    /// as fully utilized so it is never selected.
    pub fn utilization(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        let obsolete = self.obsolete_bytes.min(self.total_bytes);
        (self.total_bytes - obsolete) as f64 / self.total_bytes as f64
    }

    fn add(&mut self, other: &FileSummary) {
        self.total_bytes += other.total_bytes;
        self.obsolete_bytes += other.obsolete_bytes;
        self.obsolete_count += other.obsolete_count;
    }
}

/// Durable per-file utilization map.
#[derive(Debug, Default)]
pub struct UtilizationProfile {
    summaries: RwLock<BTreeMap<u32, FileSummary>>,
}

impl UtilizationProfile {
    /// Empty profile.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Summary for one file, if tracked.
    pub fn summary(&self, file: u32) -> Option<FileSummary> {
        self.summaries.read().get(&file).copied()
    }

    /// Utilization of one file; untracked files report fully utilized.
    pub fn utilization(&self, file: u32) -> f64 {
        self.summary(file).map_or(1.0, |s| s.utilization())
    }

    /// The lowest-utilization file not in `exclude`, when one falls below
    /// `threshold` (or unconditionally with `force`).
    pub fn best_file<F>(&self, exclude: F, threshold: f64, force: bool) -> Option<u32>
    where
        F: Fn(u32) -> bool,
    {
        let summaries = self.summaries.read();
        let best = summaries
            .iter()
            .filter(|(file, _)| !exclude(**file))
            .min_by(|a, b| a.1.utilization().total_cmp(&b.1.utilization()))?;
        if force || best.1.utilization() < threshold {
            Some(*best.0)
        } else {
            None
        }
    }

    /// Files whose utilization is below `threshold`.
    pub fn low_utilization_files<F>(&self, exclude: F, threshold: f64) -> Vec<u32>
    where
        F: Fn(u32) -> bool,
    {
        self.summaries
            .read()
            .iter()
            .filter(|(file, summary)| !exclude(**file) && summary.utilization() < threshold)
            .map(|(file, _)| *file)
            .collect()
    }

    /// Drops all accounting for a deleted file.
    pub fn remove_file(&self, file: u32) {
        self.summaries.write().remove(&file);
    }

    fn apply(&self, deltas: &HashMap<u32, FileSummary>) {
        let mut summaries = self.summaries.write();
        for (file, delta) in deltas {
            summaries.entry(*file).or_default().add(delta);
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    deltas: HashMap<u32, FileSummary>,
    unflushed_bytes: u64,
}

/// In-memory accumulator of utilization changes.
#[derive(Debug)]
pub struct UtilizationTracker {
    profile: Arc<UtilizationProfile>,
    bytes_interval: u64,
    state: Mutex<TrackerState>,
}

impl UtilizationTracker {
    /// Tracker flushing into `profile` every `bytes_interval` counted
    /// bytes.
    pub fn new(profile: Arc<UtilizationProfile>, bytes_interval: u64) -> Arc<Self> {
        Arc::new(UtilizationTracker {
            profile,
            bytes_interval,
            state: Mutex::new(TrackerState::default()),
        })
    }

    /// Counts a freshly appended entry.
    pub fn count_new_entry(&self, file: u32, bytes: u64) {
        let mut state = self.state.lock();
        state.deltas.entry(file).or_default().total_bytes += bytes;
        self.note_bytes(&mut state, bytes);
    }

    /// Counts an entry that became obsolete.
    pub fn count_obsolete(&self, file: u32, bytes: u64) {
        let mut state = self.state.lock();
        let delta = state.deltas.entry(file).or_default();
        delta.obsolete_bytes += bytes;
        delta.obsolete_count += 1;
        self.note_bytes(&mut state, bytes);
    }

    fn note_bytes(&self, state: &mut TrackerState, bytes: u64) {
        state.unflushed_bytes += bytes;
        if self.bytes_interval > 0 && state.unflushed_bytes >= self.bytes_interval {
            self.flush_locked(state);
        }
    }

    /// Folds all pending deltas into the profile.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
    }

    fn flush_locked(&self, state: &mut TrackerState) {
        if state.deltas.is_empty() {
            state.unflushed_bytes = 0;
            return;
        }
        debug!(files = state.deltas.len(), bytes = state.unflushed_bytes,
            "cleaner.utilization.flush");
        self.profile.apply(&state.deltas);
        state.deltas.clear();
        state.unflushed_bytes = 0;
    }

    /// Drops pending deltas for a deleted file.
    pub fn remove_file(&self, file: u32) {
        self.state.lock().deltas.remove(&file);
    }
}
