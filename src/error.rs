//! Error types for configuration, the erosion engine and controller misuse.

use thiserror::Error;

use crate::controller::ControllerState;

/// Invalid race configuration. Raised at initialization, never clamped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("grid must have at least 4 rows and 2 columns, got {rows}x{cols}")]
    GridShape { rows: usize, cols: usize },
    #[error("grid lengths must be positive and finite, got ({length_x}, {length_y})")]
    GridLength { length_x: f64, length_y: f64 },
    #[error("particle count must be positive")]
    ParticleCount,
    #[error("bucket count must be positive")]
    BucketCount,
    #[error("speed factor must lie in (0, 1], got {0}")]
    SpeedFactor(f64),
    #[error("pixel scale must be positive")]
    Scale,
    #[error("timestep must be positive and finite, got {0}")]
    Timestep(f64),
    #[error("boundary code {0} must be four digits of 0 (reflective) or 1 (fixed)")]
    BoundaryCode(u32),
    #[error("boundary code {0} leaves the base-level row unfixed; particles could never arrive")]
    BaseLevelNotFixed(u32),
    #[error("erosion parameter `{name}` must be non-negative and finite, got {value}")]
    Parameter { name: &'static str, value: f64 },
    #[error("failed to read config {path}: {message}")]
    Read { path: String, message: String },
}

/// Failure reported by the erosion engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("engine used before initialize()")]
    NotInitialized,
    #[error("expected {expected} values for the grid, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("invalid boundary code {0}")]
    BoundaryCode(u32),
    #[error("no fixed boundary cell; flow has nowhere to drain")]
    NoOutlet,
    #[error("engine reported receiver {receiver} for cell {cell}, outside 0..{cells}")]
    InvalidReceiver { cell: usize, receiver: usize, cells: usize },
    #[error("engine failure: {0}")]
    Other(String),
}

/// Top-level error surfaced by the race core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RaceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("erosion engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("invalid state transition: cannot {action} while {from}")]
    InvalidTransition { from: ControllerState, action: &'static str },
    #[error("failed to spawn simulation worker: {0}")]
    WorkerSpawn(String),
    #[error("simulation worker panicked")]
    WorkerPanicked,
}

pub type Result<T> = std::result::Result<T, RaceError>;
