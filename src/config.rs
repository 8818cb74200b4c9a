//! Hyperparameters and run options of a mapping run.
//!
//! The [`HyperparameterSet`] is owned by the caller, passed into every mapping
//! run and handed back (possibly recalibrated), so repeated runs warm-start
//! from the previous calibration. It persists as TOML.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{MappingError, Result};
use crate::models::motion::NoiseModelKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimplificationParameters {
    /// Largest distance a discarded point may lie from its retained segment.
    pub max_deviation: f64,
    /// Shortest allowed distance between consecutive dominant points.
    pub min_segment_length: f64,
}

impl Default for SimplificationParameters {
    fn default() -> Self {
        Self {
            max_deviation: 0.1,
            min_segment_length: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParameters {
    /// Half width, in arc length, of the neighbourhood compared around a point.
    pub neighborhood_length: f64,
    /// Pairs must score strictly below this dissimilarity.
    pub max_dissimilarity: f64,
    /// Pairs whose heading separation lies within this angle of a reversal are rejected.
    pub cycle_break_angle: f64,
    /// Number of offsets sampled over the neighbourhood.
    pub samples: usize,
}

impl Default for DetectorParameters {
    fn default() -> Self {
        Self {
            neighborhood_length: 2.0,
            max_dissimilarity: 0.05,
            cycle_break_angle: 2.0,
            samples: 21,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParameters {
    /// Loop-closure variances `[translation, rotation]` before score scaling.
    pub loop_closure_gamma: [f64; 2],
    /// Odometry noise coefficients `a1..a4`.
    pub odometry_noise: [f64; 4],
    /// Radius of the point windows aligned for loop-closure measurements.
    pub icp_radius: f64,
}

impl Default for SolverParameters {
    fn default() -> Self {
        Self {
            loop_closure_gamma: [0.1, 0.05],
            odometry_noise: [0.01, 0.01, 0.01, 0.01],
            icp_radius: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperparameterSet {
    pub simplification: SimplificationParameters,
    pub detector: DetectorParameters,
    pub solver: SolverParameters,
}

impl HyperparameterSet {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<HyperparameterSet> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMode {
    /// Compare turning-angle profiles around each dominant point.
    #[default]
    Correlation,
    /// Align point windows of the densified path.
    Icp,
}

impl FromStr for DetectionMode {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "correlation" => Ok(DetectionMode::Correlation),
            "icp" => Ok(DetectionMode::Icp),
            _ => Err(MappingError::InvalidMode {
                kind: "detection",
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClosureMeasurementMode {
    /// Both ends of a closure are the same pose.
    #[default]
    Coincident,
    /// The relative pose is estimated by aligning the two neighbourhoods.
    Aligned,
}

impl FromStr for ClosureMeasurementMode {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coincident" => Ok(ClosureMeasurementMode::Coincident),
            "aligned" => Ok(ClosureMeasurementMode::Aligned),
            _ => Err(MappingError::InvalidMode {
                kind: "closure measurement",
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingOptions {
    pub detection: DetectionMode,
    pub closure_measurement: ClosureMeasurementMode,
    pub noise_model: NoiseModelKind,
    pub calibrate_detector: bool,
    pub calibrate_solver: bool,
    /// Cost evaluations per calibration.
    pub calibration_budget: usize,
    pub seed: u64,
}

impl Default for MappingOptions {
    fn default() -> Self {
        Self {
            detection: DetectionMode::default(),
            closure_measurement: ClosureMeasurementMode::default(),
            noise_model: NoiseModelKind::default(),
            calibrate_detector: false,
            calibrate_solver: false,
            calibration_budget: 30,
            seed: 0,
        }
    }
}
