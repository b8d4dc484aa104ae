//! Multiple-flow-direction stream power solver.
//!
//! Each step:
//! 1. Depression filling (Planchon-Darboux) so every cell drains to a fixed edge
//! 2. Multiple-flow-direction routing: weights proportional to `slope^p`
//! 3. Drainage area accumulation, ridges to outlets
//! 4. Implicit channel incision `Kf * A^m * S`, solved outlets to ridges
//! 5. Deposition of a share `G` of the incoming sediment flux per unit area
//! 6. Explicit hillslope diffusion, sub-stepped to stay stable
//!
//! Parallelization: routing and diffusion are per-cell and use rayon.

use log::debug;
use rayon::prelude::*;

use super::{BoundaryConditions, ErosionEngine, ErosionParameters, FlowView, MAX_RECEIVERS};
use crate::error::EngineError;
use crate::grid::Grid;

/// Minimum drop enforced across filled depressions.
const FILL_EPSILON: f64 = 1e-4;

/// Explicit 2D diffusion is stable while `kd * dt * (1/dx^2 + 1/dy^2) <= 0.5`.
const DIFFUSION_STABILITY: f64 = 0.5;

/// Built-in landscape evolution engine.
#[derive(Debug, Default)]
pub struct StreamPowerEngine {
    grid: Option<Grid>,
    elevation: Vec<f64>,
    params: ErosionParameters,
    uplift: Vec<f64>,
    boundary: BoundaryConditions,
    dt: f64,

    // Flow field, MAX_RECEIVERS slots per cell
    receivers: Vec<usize>,
    weights: Vec<f64>,
    distances: Vec<f64>,
    single_receivers: Vec<usize>,

    steps: u64,
}

impl StreamPowerEngine {
    pub fn new() -> Self {
        Self { dt: 1.0, ..Default::default() }
    }

    /// Number of steps taken since `initialize`.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn require_grid(&self) -> Result<Grid, EngineError> {
        self.grid.ok_or(EngineError::NotInitialized)
    }

    fn fixed_mask(&self, grid: &Grid) -> Vec<bool> {
        (0..grid.len())
            .map(|i| {
                let (row, col) = grid.coords(i);
                self.boundary.is_fixed(grid, row, col)
            })
            .collect()
    }

    fn reset_flow(&mut self, cells: usize) {
        self.receivers = (0..cells)
            .flat_map(|i| std::iter::repeat(i).take(MAX_RECEIVERS))
            .collect();
        self.weights = vec![0.0; cells * MAX_RECEIVERS];
        self.distances = vec![1.0; cells * MAX_RECEIVERS];
        self.single_receivers = (0..cells).collect();
    }

    /// Compute multiple-flow-direction receivers over the filled surface.
    fn route(&mut self, grid: &Grid, filled: &[f64], fixed: &[bool]) {
        let p = self.params.p;

        self.receivers
            .par_chunks_mut(MAX_RECEIVERS)
            .zip(self.weights.par_chunks_mut(MAX_RECEIVERS))
            .zip(self.distances.par_chunks_mut(MAX_RECEIVERS))
            .zip(self.single_receivers.par_iter_mut())
            .enumerate()
            .for_each(|(i, (((recv, wts), dist), single))| {
                recv.fill(i);
                wts.fill(0.0);
                dist.fill(1.0);
                *single = i;
                if fixed[i] {
                    return;
                }

                let (row, col) = grid.coords(i);
                let mut total = 0.0;
                let mut steepest = 0.0;
                let mut k = 0;
                for (j, d) in grid.neighbors_8(row, col) {
                    let drop = filled[i] - filled[j];
                    if drop <= 0.0 {
                        continue;
                    }
                    let slope = drop / d;
                    let w = slope.powf(p);
                    recv[k] = j;
                    wts[k] = w;
                    dist[k] = d;
                    total += w;
                    k += 1;
                    if slope > steepest {
                        steepest = slope;
                        *single = j;
                    }
                }

                if total > 0.0 {
                    for w in wts[..k].iter_mut() {
                        *w /= total;
                    }
                }
            });
    }

    /// Upstream area draining through each cell.
    fn drainage_area(&self, grid: &Grid, stack: &[usize]) -> Vec<f64> {
        let mut area = vec![grid.cell_area(); grid.len()];
        for &i in stack.iter().rev() {
            let a = area[i];
            for k in i * MAX_RECEIVERS..(i + 1) * MAX_RECEIVERS {
                let w = self.weights[k];
                if w > 0.0 {
                    area[self.receivers[k]] += a * w;
                }
            }
        }
        area
    }

    /// Implicit stream power incision with n = 1. Receivers are always lower in
    /// `stack`, so their new elevation is known when a cell is solved.
    fn incise(&mut self, stack: &[usize], area: &[f64], fixed: &[bool]) {
        let dt = self.dt;
        let kf = self.params.kf;
        let m = self.params.area_exponent;

        for &i in stack {
            if fixed[i] {
                continue;
            }
            let stream_power = kf * area[i].powf(m) * dt;
            let mut factor_sum = 0.0;
            let mut pull = 0.0;
            for k in i * MAX_RECEIVERS..(i + 1) * MAX_RECEIVERS {
                let w = self.weights[k];
                if w <= 0.0 {
                    continue;
                }
                let f = stream_power * w / self.distances[k];
                factor_sum += f;
                pull += f * self.elevation[self.receivers[k]];
            }
            self.elevation[i] = (self.elevation[i] + self.uplift[i] * dt + pull) / (1.0 + factor_sum);
        }
    }

    /// Route eroded material downstream and drop a share `G` of it per unit drainage area.
    fn deposit(&mut self, grid: &Grid, stack: &[usize], area: &[f64], before: &[f64], fixed: &[bool]) {
        let g = self.params.g;
        if g <= 0.0 {
            return;
        }
        let dt = self.dt;
        let cell_area = grid.cell_area();
        let mut flux = vec![0.0; grid.len()];

        for &i in stack.iter().rev() {
            if fixed[i] {
                // Sediment reaching base level leaves the domain
                continue;
            }
            let eroded = (before[i] + self.uplift[i] * dt - self.elevation[i]).max(0.0) * cell_area;
            let incoming = flux[i];
            let deposited = (g * incoming / area[i] * cell_area).min(incoming);
            self.elevation[i] += deposited / cell_area;

            let outgoing = incoming - deposited + eroded;
            for k in i * MAX_RECEIVERS..(i + 1) * MAX_RECEIVERS {
                let w = self.weights[k];
                if w > 0.0 {
                    flux[self.receivers[k]] += outgoing * w;
                }
            }
        }
    }

    /// Linear hillslope diffusion with zero-flux (reflective) edges.
    fn diffuse(&mut self, grid: &Grid, fixed: &[bool]) {
        let kd = self.params.kd;
        if kd <= 0.0 {
            return;
        }
        let (dx, dy) = grid.spacing();
        let (inv_dx2, inv_dy2) = (1.0 / (dx * dx), 1.0 / (dy * dy));
        let ratio = kd * self.dt * (inv_dx2 + inv_dy2);
        let substeps = (ratio / DIFFUSION_STABILITY).ceil().max(1.0) as usize;
        let sub_dt = self.dt / substeps as f64;
        let (rows, cols) = (grid.rows, grid.cols);

        for _ in 0..substeps {
            let h = &self.elevation;
            let next: Vec<f64> = (0..grid.len())
                .into_par_iter()
                .map(|i| {
                    if fixed[i] {
                        return h[i];
                    }
                    let (r, c) = grid.coords(i);
                    let left = h[grid.index(r, c.saturating_sub(1))];
                    let right = h[grid.index(r, (c + 1).min(cols - 1))];
                    let up = h[grid.index(r.saturating_sub(1), c)];
                    let down = h[grid.index((r + 1).min(rows - 1), c)];
                    let d2x = (left - 2.0 * h[i] + right) * inv_dx2;
                    let d2y = (up - 2.0 * h[i] + down) * inv_dy2;
                    h[i] + kd * sub_dt * (d2x + d2y)
                })
                .collect();
            self.elevation = next;
        }
    }
}

impl ErosionEngine for StreamPowerEngine {
    fn initialize(&mut self, grid: &Grid) -> Result<(), EngineError> {
        let cells = grid.len();
        self.grid = Some(*grid);
        self.elevation = vec![0.0; cells];
        self.uplift = vec![0.0; cells];
        self.reset_flow(cells);
        self.steps = 0;
        debug!("Stream power engine initialized for {}x{} grid", grid.rows, grid.cols);
        Ok(())
    }

    fn set_topography(&mut self, elevation: &[f64]) -> Result<(), EngineError> {
        let grid = self.require_grid()?;
        if elevation.len() != grid.len() {
            return Err(EngineError::ShapeMismatch { expected: grid.len(), actual: elevation.len() });
        }
        self.elevation.copy_from_slice(elevation);
        Ok(())
    }

    fn set_parameters(&mut self, params: &ErosionParameters, uplift: &[f64]) -> Result<(), EngineError> {
        let grid = self.require_grid()?;
        if uplift.len() != grid.len() {
            return Err(EngineError::ShapeMismatch { expected: grid.len(), actual: uplift.len() });
        }
        self.params = params.clone();
        self.uplift.copy_from_slice(uplift);
        Ok(())
    }

    fn set_boundary_conditions(&mut self, code: u32) -> Result<(), EngineError> {
        self.boundary = BoundaryConditions::from_code(code).ok_or(EngineError::BoundaryCode(code))?;
        Ok(())
    }

    fn set_timestep(&mut self, dt: f64) -> Result<(), EngineError> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(EngineError::Other(format!("timestep must be positive, got {}", dt)));
        }
        self.dt = dt;
        Ok(())
    }

    fn step(&mut self) -> Result<(), EngineError> {
        let grid = self.require_grid()?;
        let fixed = self.fixed_mask(&grid);
        if !fixed.iter().any(|&f| f) {
            return Err(EngineError::NoOutlet);
        }

        let filled = fill_depressions(&grid, &self.elevation, &fixed);
        self.route(&grid, &filled, &fixed);

        // Outlets first; every receiver is strictly lower on the filled surface
        let mut stack: Vec<usize> = (0..grid.len()).collect();
        stack.par_sort_unstable_by(|&a, &b| filled[a].total_cmp(&filled[b]));

        let area = self.drainage_area(&grid, &stack);
        let before = self.elevation.clone();
        self.incise(&stack, &area, &fixed);
        self.deposit(&grid, &stack, &area, &before, &fixed);
        self.diffuse(&grid, &fixed);

        self.steps += 1;
        Ok(())
    }

    fn destroy(&mut self) {
        self.grid = None;
        self.elevation.clear();
        self.uplift.clear();
        self.receivers.clear();
        self.weights.clear();
        self.distances.clear();
        self.single_receivers.clear();
        self.steps = 0;
    }

    fn elevation(&self) -> &[f64] {
        &self.elevation
    }

    fn flow(&self) -> FlowView<'_> {
        FlowView {
            stride: MAX_RECEIVERS,
            receivers: &self.receivers,
            weights: &self.weights,
            single_receivers: &self.single_receivers,
        }
    }
}

/// Fill depressions using the Planchon-Darboux sweep. Fixed cells keep their
/// height; every other cell ends at least `FILL_EPSILON` above its lowest
/// neighbour, so it has a strictly lower neighbour to drain into.
fn fill_depressions(grid: &Grid, elevation: &[f64], fixed: &[bool]) -> Vec<f64> {
    let n = grid.len();
    let mut water: Vec<f64> = (0..n)
        .map(|i| if fixed[i] { elevation[i] } else { f64::MAX })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..n {
            changed |= lower_water(grid, elevation, fixed, &mut water, i);
        }
        for i in (0..n).rev() {
            changed |= lower_water(grid, elevation, fixed, &mut water, i);
        }
    }
    water
}

fn lower_water(grid: &Grid, elevation: &[f64], fixed: &[bool], water: &mut [f64], i: usize) -> bool {
    if fixed[i] {
        return false;
    }
    let (row, col) = grid.coords(i);
    let min_neigh = grid
        .neighbors_8(row, col)
        .map(|(j, _)| water[j])
        .fold(f64::MAX, f64::min);
    if min_neigh == f64::MAX {
        return false;
    }
    let new_water = elevation[i].max(min_neigh + FILL_EPSILON);
    if new_water < water[i] {
        water[i] = new_water;
        true
    } else {
        false
    }
}
