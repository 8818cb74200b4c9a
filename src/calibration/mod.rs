//! Ground-truth free calibration of detector and solver hyperparameters.
//!
//! Detector parameters are scored by how tightly and how abundantly the
//! detected loop closures cluster in arc length. Solver parameters are scored
//! by how well the optimized graph reproduces the lap length estimated from
//! the detection.

pub mod bayes_opt;

use nalgebra::Vector2;
use rayon::prelude::*;

use crate::config::{DetectionMode, DetectorParameters, MappingOptions, SolverParameters};
use crate::mapping::circumference::{clustered_min_mean, select_mixture, CircumferenceEstimate};
use crate::mapping::loop_closure::{detect, Detection};
use crate::mapping;
use crate::utils::{deg2rad, rad2deg};
use bayes_opt::{BayesianOptimizer, ParameterBounds};

pub fn detector_domain() -> Vec<ParameterBounds> {
    vec![
        ParameterBounds::log("neighborhood_length", 0.5, 10.0),
        ParameterBounds::log("max_dissimilarity", 1e-4, 1.0),
        ParameterBounds::linear("cycle_break_angle", deg2rad(30.0), deg2rad(170.0)),
    ]
}

pub fn solver_domain() -> Vec<ParameterBounds> {
    vec![
        ParameterBounds::log("gamma_translation", 1e-4, 10.0),
        ParameterBounds::log("gamma_rotation", 1e-4, 10.0),
        ParameterBounds::log("a1", 1e-4, 1.0),
        ParameterBounds::log("a2", 1e-4, 1.0),
        ParameterBounds::log("a3", 1e-4, 1.0),
        ParameterBounds::log("a4", 1e-4, 1.0),
    ]
}

fn detector_parameters(base: &DetectorParameters, values: &[f64]) -> DetectorParameters {
    DetectorParameters {
        neighborhood_length: values[0],
        max_dissimilarity: values[1],
        cycle_break_angle: values[2],
        samples: base.samples,
    }
}

fn solver_parameters(base: &SolverParameters, values: &[f64]) -> SolverParameters {
    SolverParameters {
        loop_closure_gamma: [values[0], values[1]],
        odometry_noise: [values[2], values[3], values[4], values[5]],
        icp_radius: base.icp_radius,
    }
}

/// Mixture negative log-likelihood per loop closure minus the log of the
/// closure count. Infinite with fewer than two closures.
pub fn detector_cost(points: &[Vector2<f64>], params: &DetectorParameters, mode: DetectionMode) -> f64 {
    let separations = detect(points, params, mode).closures.arc_lengths();
    let n = separations.len();
    if n < 2 {
        return f64::INFINITY;
    }
    match select_mixture(&separations) {
        Some(fit) => fit.negative_log_likelihood / n as f64 - (n as f64).ln(),
        None => f64::INFINITY,
    }
}

/// Distance between `estimate` and the lap length re-clustered from the
/// node-to-node path lengths of the loop closures after optimization.
pub fn solver_cost(
    points: &[Vector2<f64>],
    detection: &Detection,
    estimate: &CircumferenceEstimate,
    params: &SolverParameters,
    options: &MappingOptions,
) -> f64 {
    let (graph, report) = match mapping::solve(points, detection, params, options) {
        Ok(solved) => solved,
        Err(err) => {
            log::debug!("solver evaluation failed: {err}");
            return f64::INFINITY;
        }
    };
    if !report.final_error.is_finite() {
        return f64::INFINITY;
    }
    let traversed: Vec<f64> = graph
        .loop_closure_endpoints()
        .iter()
        .map(|&(i, j)| graph.traversed_length(i, j))
        .collect();
    let components = estimate.components.min(traversed.len());
    match clustered_min_mean(&traversed, components) {
        Some(lap) => (estimate.circumference - lap).abs(),
        None => f64::INFINITY,
    }
}

/// Searches detector parameters starting from `current`; keeps `current`
/// when no candidate produces a finite cost.
pub fn calibrate_detector(
    points: &[Vector2<f64>],
    current: &DetectorParameters,
    options: &MappingOptions,
) -> DetectorParameters {
    let optimizer = BayesianOptimizer::new(detector_domain(), options.calibration_budget, options.seed);
    let start = [current.neighborhood_length, current.max_dissimilarity, current.cycle_break_angle];
    let trace = optimizer.minimize(
        |values| detector_cost(points, &detector_parameters(current, values), options.detection),
        Some(&start[..]),
    );
    match trace {
        Some(trace) if trace.best.cost.is_finite() => {
            let calibrated = detector_parameters(current, &trace.best.parameters);
            log::info!(
                "calibrated detector, cost {:.4}, cycle break {:.1} deg: {calibrated:?}",
                trace.best.cost,
                rad2deg(calibrated.cycle_break_angle)
            );
            calibrated
        }
        _ => {
            log::warn!("detector calibration found no usable parameters, keeping {current:?}");
            current.clone()
        }
    }
}

/// Searches solver parameters for a fixed detection starting from `current`.
///
/// Without a circumference estimate there is no target and `current` is kept.
pub fn calibrate_solver(
    points: &[Vector2<f64>],
    detection: &Detection,
    estimate: Option<&CircumferenceEstimate>,
    current: &SolverParameters,
    options: &MappingOptions,
) -> SolverParameters {
    let Some(estimate) = estimate else {
        log::warn!("no circumference estimate, solver calibration skipped");
        return current.clone();
    };
    let optimizer = BayesianOptimizer::new(solver_domain(), options.calibration_budget, options.seed);
    let [g1, g2] = current.loop_closure_gamma;
    let [a1, a2, a3, a4] = current.odometry_noise;
    let start = [g1, g2, a1, a2, a3, a4];
    let trace = optimizer.minimize(
        |values| solver_cost(points, detection, estimate, &solver_parameters(current, values), options),
        Some(&start[..]),
    );
    match trace {
        Some(trace) if trace.best.cost.is_finite() => {
            let calibrated = solver_parameters(current, &trace.best.parameters);
            log::info!("calibrated solver, cost {:.4}: {calibrated:?}", trace.best.cost);
            calibrated
        }
        _ => {
            log::warn!("solver calibration found no usable parameters, keeping {current:?}");
            current.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepCell {
    pub neighborhood_length: f64,
    pub max_dissimilarity: f64,
    pub cost: f64,
}

/// Detector cost over the grid `neighborhood_lengths` x `thresholds`, row major.
pub fn detector_cost_sweep(
    points: &[Vector2<f64>],
    base: &DetectorParameters,
    mode: DetectionMode,
    neighborhood_lengths: &[f64],
    thresholds: &[f64],
) -> Vec<SweepCell> {
    let grid: Vec<(f64, f64)> = neighborhood_lengths
        .iter()
        .flat_map(|&l| thresholds.iter().map(move |&c| (l, c)))
        .collect();
    grid.into_par_iter()
        .map(|(neighborhood_length, max_dissimilarity)| {
            let params = DetectorParameters {
                neighborhood_length,
                max_dissimilarity,
                ..base.clone()
            };
            SweepCell {
                neighborhood_length,
                max_dissimilarity,
                cost: detector_cost(points, &params, mode),
            }
        })
        .collect()
}
