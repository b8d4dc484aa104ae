//! Column buckets at the base level and the race result.

use crate::error::ConfigError;
use crate::grid::Grid;

/// Fixed-width column buckets spanning `[0, cols * scale)` pixels.
///
/// Counts are rebuilt from scratch on every [`BucketTally::tally`] call.
#[derive(Debug, Clone)]
pub struct BucketTally {
    base_row: usize,
    scale: u32,
    /// `n_buckets + 1` strictly increasing edges in pixels
    edges: Vec<f64>,
    counts: Vec<usize>,
    n_particles: usize,
}

impl BucketTally {
    pub fn new(grid: &Grid, n_buckets: usize, scale: u32) -> Result<Self, ConfigError> {
        if n_buckets == 0 {
            return Err(ConfigError::BucketCount);
        }
        if scale == 0 {
            return Err(ConfigError::Scale);
        }
        let width = (grid.cols * scale as usize) as f64;
        let edges = (0..=n_buckets)
            .map(|k| k as f64 * width / n_buckets as f64)
            .collect();
        Ok(Self {
            base_row: grid.base_row(),
            scale,
            edges,
            counts: vec![0; n_buckets],
            n_particles: 0,
        })
    }

    pub fn n_buckets(&self) -> usize {
        self.counts.len()
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Bucket edges rounded up to whole pixels, for drawing separators.
    pub fn separators(&self) -> Vec<u32> {
        self.edges.iter().map(|e| e.ceil() as u32).collect()
    }

    /// Bucket holding a particle in column `col`.
    pub fn bucket_of(&self, col: usize) -> usize {
        let x = (col * self.scale as usize) as f64;
        let interior = &self.edges[1..self.n_buckets()];
        interior.partition_point(|&e| e <= x).min(self.n_buckets() - 1)
    }

    /// Recount every particle on the base row.
    pub fn tally(&mut self, rows: &[usize], cols: &[usize]) -> &[usize] {
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.n_particles = rows.len();
        for (&row, &col) in rows.iter().zip(cols) {
            if row == self.base_row {
                let bucket = self.bucket_of(col);
                self.counts[bucket] += 1;
            }
        }
        &self.counts
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// True once every particle of the last tally sits in a bucket.
    pub fn all_in_buckets(&self) -> bool {
        self.n_particles > 0 && self.total() == self.n_particles
    }

    /// Bucket currently ahead; lowest index on ties.
    pub fn leader(&self) -> usize {
        let mut best = 0;
        for (i, &count) in self.counts.iter().enumerate() {
            if count > self.counts[best] {
                best = i;
            }
        }
        best
    }

    /// Winning bucket, available once the race is over.
    pub fn winner(&self) -> Option<usize> {
        self.all_in_buckets().then(|| self.leader())
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.n_particles = 0;
    }
}
