//! Race configuration and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::BoundaryConditions;
use crate::error::ConfigError;
use crate::grid::Grid;

/// Everything fixed for the lifetime of a race. Changing any of it means
/// building a new controller (particle count excepted, see
/// `SimulationController::set_particle_count`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Grid rows (the base level is the last row)
    pub rows: usize,
    /// Grid columns
    pub cols: usize,
    /// Physical length along the columns
    pub length_x: f64,
    /// Physical length along the rows
    pub length_y: f64,
    /// Number of racing particles
    pub n_particles: usize,
    /// Fraction of particles that move each step, in (0, 1]
    pub speed_factor: f64,
    /// Number of column buckets at the base level
    pub n_buckets: usize,
    /// Pixels per cell, used for bucket separators and particle positions
    pub scale: u32,
    /// Engine timestep
    pub timestep: f64,
    /// Four-digit boundary code (base, right, top, left; 1 = fixed)
    pub boundary_code: u32,
    /// Extra elevation of the uplifted upper half at initialization
    pub plateau_height: f64,
    /// Master seed; random when absent
    pub seed: Option<u64>,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            rows: 170,
            cols: 170,
            length_x: 1e4,
            length_y: 2e4,
            n_particles: 10_000,
            speed_factor: 0.5,
            n_buckets: 10,
            scale: 3,
            timestep: 2e3,
            boundary_code: 1000,
            plateau_height: 1000.0,
            seed: None,
        }
    }
}

impl RaceConfig {
    /// Usual particle counts for interactive boards. Not enforced.
    pub const PARTICLES_MIN: usize = 500;
    pub const PARTICLES_MAX: usize = 15_000;

    /// Load a (possibly partial) configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let read_err = |message: String| ConfigError::Read {
            path: path.display().to_string(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| read_err(e.to_string()))?;
        let config: RaceConfig = serde_json::from_str(&text).map_err(|e| read_err(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn grid(&self) -> Grid {
        Grid::new(self.rows, self.cols, self.length_x, self.length_y)
    }

    /// Check every field; the first violation wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rows < 4 || self.cols < 2 {
            return Err(ConfigError::GridShape { rows: self.rows, cols: self.cols });
        }
        let length_ok = |l: f64| l.is_finite() && l > 0.0;
        if !length_ok(self.length_x) || !length_ok(self.length_y) {
            return Err(ConfigError::GridLength {
                length_x: self.length_x,
                length_y: self.length_y,
            });
        }
        if self.n_particles == 0 {
            return Err(ConfigError::ParticleCount);
        }
        if self.n_buckets == 0 {
            return Err(ConfigError::BucketCount);
        }
        if !(self.speed_factor > 0.0 && self.speed_factor <= 1.0) {
            return Err(ConfigError::SpeedFactor(self.speed_factor));
        }
        if self.scale == 0 {
            return Err(ConfigError::Scale);
        }
        if !(self.timestep.is_finite() && self.timestep > 0.0) {
            return Err(ConfigError::Timestep(self.timestep));
        }
        let boundary = BoundaryConditions::from_code(self.boundary_code)
            .ok_or(ConfigError::BoundaryCode(self.boundary_code))?;
        if !boundary.base {
            return Err(ConfigError::BaseLevelNotFixed(self.boundary_code));
        }
        Ok(())
    }
}
