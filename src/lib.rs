//! Erosion race library
//!
//! A landscape evolves under a stochastic multiple-flow-direction erosion
//! model while particles race downhill along the flow graph into column
//! buckets at the base level. The bucket holding the most particles once all
//! have arrived wins.

pub mod buckets;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod grid;
pub mod particles;
pub mod routing;
pub mod snapshot;

pub use buckets::BucketTally;
pub use config::RaceConfig;
pub use controller::{ControllerState, RaceCore, RunOutcome, SimulationController};
pub use engine::{ErosionEngine, ErosionParameters, StreamPowerEngine};
pub use error::{ConfigError, EngineError, RaceError};
pub use grid::Grid;
pub use particles::{ParticleField, SpeedFactor};
pub use routing::{FlowRouter, ReceiverMap};
pub use snapshot::{Snapshot, SnapshotReader};
