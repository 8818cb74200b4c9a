//! Boundary mapping from drifting odometry: path simplification, loop-closure
//! detection, SE2 pose-graph optimization, lap-length estimation and
//! ground-truth free hyperparameter calibration.

pub mod calibration;
pub mod config;
pub mod data;
pub mod error;
pub mod mapping;
pub mod models;
pub mod utils;

pub use config::{HyperparameterSet, MappingOptions};
pub use error::{MappingError, Result};
pub use mapping::{run_mapping, MappingOutput};
