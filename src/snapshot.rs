//! Point-in-time view of the race for renderers and UIs.
//!
//! The worker builds a complete [`Snapshot`] after each step and swaps it in
//! behind an `Arc`; readers clone the `Arc` and never see a half-updated step.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::grid::Grid;

/// Consistent copy of everything a consumer may draw. All fields come from the same step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Completed engine steps since the last reset
    pub step: u64,
    pub grid: Grid,
    pub elevation: Vec<f64>,
    pub receivers: Vec<usize>,
    pub particle_rows: Vec<usize>,
    pub particle_cols: Vec<usize>,
    /// Top-left pixel of each particle
    pub particle_x: Vec<u32>,
    pub particle_y: Vec<u32>,
    /// Cosmetic sizes, passed through for drawing
    pub particle_sizes: Vec<u8>,
    /// Bucket edges in pixels, `n_buckets + 1` values
    pub bucket_edges: Vec<f64>,
    /// Edges rounded up to whole pixels, where separators are drawn
    pub bucket_separators: Vec<u32>,
    pub bucket_counts: Vec<usize>,
    /// Bucket currently ahead (lowest index on ties)
    pub leader: usize,
    pub all_in_buckets: bool,
    /// Set once every particle has arrived
    pub winner: Option<usize>,
    /// Engine failure that ended the last run, if any
    pub failure: Option<String>,
}

impl Snapshot {
    pub fn n_particles(&self) -> usize {
        self.particle_rows.len()
    }

    /// Particles already sitting in a bucket.
    pub fn arrived(&self) -> usize {
        self.bucket_counts.iter().sum()
    }
}

/// Shared slot holding the latest snapshot. The lock is only held to swap or clone the `Arc`.
#[derive(Debug)]
pub struct SnapshotCell {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotCell {
    pub fn new(initial: Snapshot) -> Self {
        Self { current: RwLock::new(Arc::new(initial)) }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        let next = Arc::new(snapshot);
        // A poisoned lock still holds a whole snapshot
        let mut slot = self.current.write().unwrap_or_else(|e| e.into_inner());
        *slot = next;
    }

    pub fn load(&self) -> Arc<Snapshot> {
        let slot = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*slot)
    }
}

/// Cloneable read handle for consumers on other threads.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    cell: Arc<SnapshotCell>,
}

impl SnapshotReader {
    pub(crate) fn new(cell: Arc<SnapshotCell>) -> Self {
        Self { cell }
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.cell.load()
    }
}
