//! Erosion coefficients and boundary conditions handed to the engine

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::grid::Grid;

/// Live-tunable erosion coefficients. Applied at the start of a simulation step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErosionParameters {
    // =========================================================================
    // Channel (stream power) terms
    // =========================================================================

    /// River incision coefficient Kf
    pub kf: f64,

    /// Drainage area exponent m in `Kf * A^m * S`
    pub area_exponent: f64,

    /// River transport (deposition) coefficient G.
    /// 0 = detachment-limited, larger values deposit more of the incoming sediment
    pub g: f64,

    /// Flow partition exponent p: receiver weights are proportional to `slope^p`.
    /// 0 spreads flow evenly over lower neighbours, large values approach steepest descent
    pub p: f64,

    // =========================================================================
    // Hillslope and tectonic terms
    // =========================================================================

    /// Hillslope diffusivity Kd
    pub kd: f64,

    /// Uplift rate applied to the plateau half of the grid
    pub uplift_rate: f64,
}

impl Default for ErosionParameters {
    fn default() -> Self {
        Self {
            kf: 1e-4,
            area_exponent: 0.4,
            g: 1.0,
            p: 1.0,
            kd: 1e-2,
            uplift_rate: 0.0,
        }
    }
}

impl ErosionParameters {
    // Ranges exposed by the interactive board's sliders. Not enforced here.
    pub const KF_MIN: f64 = 5e-5;
    pub const KF_MAX: f64 = 3e-4;
    pub const G_MIN: f64 = 0.5;
    pub const G_MAX: f64 = 1.5;
    pub const KD_MIN: f64 = 0.0;
    pub const KD_MAX: f64 = 0.1;
    pub const P_MIN: f64 = 0.0;
    pub const P_MAX: f64 = 10.0;

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("kf", self.kf),
            ("area_exponent", self.area_exponent),
            ("g", self.g),
            ("p", self.p),
            ("kd", self.kd),
            ("uplift_rate", self.uplift_rate),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Parameter { name, value });
            }
        }
        Ok(())
    }

    /// Spatial uplift field: `uplift_rate` on the plateau (`row < rows / 2`), zero below the scarp.
    pub fn uplift_field(&self, grid: &Grid) -> Vec<f64> {
        let scarp = grid.scarp_row() * grid.cols;
        (0..grid.len())
            .map(|i| if i < scarp { self.uplift_rate } else { 0.0 })
            .collect()
    }
}

/// Which grid edges are fixed base level (true) or reflective (false).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundaryConditions {
    /// Last row
    pub base: bool,
    /// Last column
    pub right: bool,
    /// Row 0
    pub top: bool,
    /// Column 0
    pub left: bool,
}

impl Default for BoundaryConditions {
    fn default() -> Self {
        Self { base: true, right: false, top: false, left: false }
    }
}

impl BoundaryConditions {
    /// Parse a four-digit code (base, right, top, left). Leading zeros may be
    /// dropped, so `100` reads as `0100`. Returns None for digits other than 0/1.
    ///
    /// Codes written for a solver whose x axis runs along the rows name the
    /// sides in a different order: their `100` fixes the base row, which is
    /// `1000` here. Under this order `100` fixes the last column only, and
    /// `RaceConfig::validate` rejects it.
    pub fn from_code(code: u32) -> Option<Self> {
        if code > 1111 {
            return None;
        }
        let digit = |place: u32| match (code / place) % 10 {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        };
        Some(Self {
            base: digit(1000)?,
            right: digit(100)?,
            top: digit(10)?,
            left: digit(1)?,
        })
    }

    /// Is the cell on a fixed (base level) edge?
    pub fn is_fixed(&self, grid: &Grid, row: usize, col: usize) -> bool {
        (self.base && row == grid.rows - 1)
            || (self.top && row == 0)
            || (self.left && col == 0)
            || (self.right && col == grid.cols - 1)
    }
}
