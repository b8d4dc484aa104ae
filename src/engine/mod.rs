//! Landscape evolution engine boundary
//!
//! The race core treats the erosion solver as an opaque collaborator behind
//! [`ErosionEngine`]. Solvers of this kind usually keep a single live context
//! per process, so the controller owns the only handle and every call goes
//! through the worker thread. [`StreamPowerEngine`] is the built-in solver.

pub mod params;
pub mod stream_power;

pub use params::{BoundaryConditions, ErosionParameters};
pub use stream_power::StreamPowerEngine;

use crate::error::EngineError;
use crate::grid::Grid;

/// Maximum number of candidate receivers reported per cell (8-connected grid).
pub const MAX_RECEIVERS: usize = 8;

/// Read-only view of the engine's multiple-flow-direction field.
///
/// Candidates are laid out cell-major with a fixed `stride`: the candidates of
/// cell `i` are `receivers[i * stride..(i + 1) * stride]` with matching
/// `weights`. Weights are non-negative but need not sum to one.
#[derive(Clone, Copy, Debug)]
pub struct FlowView<'a> {
    pub stride: usize,
    pub receivers: &'a [usize],
    pub weights: &'a [f64],
    /// Single steepest-descent receiver; equal to the cell itself at base level.
    pub single_receivers: &'a [usize],
}

impl<'a> FlowView<'a> {
    pub fn cells(&self) -> usize {
        self.single_receivers.len()
    }

    pub fn candidates(&self, cell: usize) -> (&'a [usize], &'a [f64]) {
        let range = cell * self.stride..(cell + 1) * self.stride;
        (&self.receivers[range.clone()], &self.weights[range])
    }

    pub fn is_base_level(&self, cell: usize) -> bool {
        self.single_receivers[cell] == cell
    }
}

/// Landscape evolution solver driven one step at a time.
pub trait ErosionEngine: Send {
    /// Allocate state for `grid`. Any previous context is discarded.
    fn initialize(&mut self, grid: &Grid) -> Result<(), EngineError>;

    /// Overwrite the elevation field (row-major, one value per cell).
    fn set_topography(&mut self, elevation: &[f64]) -> Result<(), EngineError>;

    /// Set erosion coefficients and the per-cell uplift field.
    fn set_parameters(&mut self, params: &ErosionParameters, uplift: &[f64]) -> Result<(), EngineError>;

    fn set_boundary_conditions(&mut self, code: u32) -> Result<(), EngineError>;

    fn set_timestep(&mut self, dt: f64) -> Result<(), EngineError>;

    /// Advance one timestep, refreshing elevation and the flow field.
    fn step(&mut self) -> Result<(), EngineError>;

    /// Release the context. `initialize` must be called again before use.
    fn destroy(&mut self);

    fn elevation(&self) -> &[f64];

    fn flow(&self) -> FlowView<'_>;
}
