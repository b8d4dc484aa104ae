//! Stochastic flow routing
//!
//! Collapses the engine's weighted multiple-flow-direction field into one
//! receiver per cell by inverse-CDF sampling. Every cell gets its own draw on
//! every step, which is what sends particles down different paths from run to run.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::engine::FlowView;
use crate::error::EngineError;
use crate::grid::Grid;

/// One receiver per cell. `receiver == cell` marks base level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceiverMap {
    grid: Grid,
    receivers: Vec<usize>,
}

impl ReceiverMap {
    /// Every cell is its own receiver; used before the first step.
    pub fn identity(grid: Grid) -> Self {
        Self { receivers: (0..grid.len()).collect(), grid }
    }

    /// Wrap a receiver vector, checking every index is a valid cell.
    pub fn from_vec(grid: Grid, receivers: Vec<usize>) -> Result<Self, EngineError> {
        let cells = grid.len();
        if receivers.len() != cells {
            return Err(EngineError::ShapeMismatch { expected: cells, actual: receivers.len() });
        }
        if let Some((cell, &receiver)) = receivers.iter().enumerate().find(|&(_, &r)| r >= cells) {
            return Err(EngineError::InvalidReceiver { cell, receiver, cells });
        }
        Ok(Self { grid, receivers })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    #[inline]
    pub fn get(&self, cell: usize) -> usize {
        self.receivers[cell]
    }

    pub fn is_base_level(&self, cell: usize) -> bool {
        self.receivers[cell] == cell
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.receivers
    }
}

/// Pick one candidate by inverse-CDF sampling with `draw` in `[0, 1)`.
///
/// Returns the first candidate whose cumulative weight reaches `draw` times
/// the weight sum. If every weight is zero the first candidate wins. A
/// zero-weight candidate can only win at index 0 with a draw of exactly 0.
pub fn sample_receiver(candidates: &[usize], weights: &[f64], draw: f64) -> usize {
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        return candidates[0];
    }

    let target = draw * total;
    let mut cumulative = 0.0;
    let mut last_positive = candidates[0];
    for (&candidate, &w) in candidates.iter().zip(weights) {
        cumulative += w.max(0.0);
        if w > 0.0 {
            last_positive = candidate;
        }
        if cumulative >= target {
            return candidate;
        }
    }
    // Only reachable through rounding when draw is just below 1
    last_positive
}

/// Builds a fresh [`ReceiverMap`] from the engine's flow field each step.
#[derive(Debug, Clone)]
pub struct FlowRouter {
    rng: ChaCha8Rng,
}

impl FlowRouter {
    pub fn new(seed: u64) -> Self {
        Self { rng: ChaCha8Rng::seed_from_u64(seed) }
    }

    /// Draw one receiver per cell. Base-level cells (single receiver equal to
    /// themselves) always route to themselves, whatever the draw.
    pub fn route(&mut self, grid: &Grid, flow: &FlowView<'_>) -> Result<ReceiverMap, EngineError> {
        let cells = grid.len();
        if flow.cells() != cells {
            return Err(EngineError::ShapeMismatch { expected: cells, actual: flow.cells() });
        }
        let slots = cells * flow.stride;
        if flow.stride == 0 || flow.receivers.len() != slots || flow.weights.len() != slots {
            return Err(EngineError::ShapeMismatch {
                expected: slots.max(cells),
                actual: flow.receivers.len().min(flow.weights.len()),
            });
        }

        let mut receivers = Vec::with_capacity(cells);
        for cell in 0..cells {
            let draw: f64 = self.rng.gen();
            let receiver = if flow.is_base_level(cell) {
                cell
            } else {
                let (candidates, weights) = flow.candidates(cell);
                sample_receiver(candidates, weights, draw)
            };
            if receiver >= cells {
                return Err(EngineError::InvalidReceiver { cell, receiver, cells });
            }
            receivers.push(receiver);
        }

        Ok(ReceiverMap { grid: *grid, receivers })
    }
}
