//! One mapping run: raw path in, optimized boundary map out.

use nalgebra::{Matrix3, Matrix3xX, Vector2, Vector3};
use nalgebra_sparse::CscMatrix;

use crate::calibration;
use crate::config::{HyperparameterSet, MappingOptions, SimplificationParameters, SolverParameters};
use crate::error::{MappingError, Result};
use crate::mapping::circumference::{estimate_circumference, CircumferenceEstimate};
use crate::mapping::loop_closure::{closure_measurements, detect, Detection, LoopClosureSet};
use crate::mapping::measurement::{dominant_poses, measurements_from_poses};
use crate::mapping::pose_graph::{
    loop_closure_information, OptimizationReport, PoseGraph, MAX_ITERATIONS,
};
use crate::mapping::simplify::{simplify, DominantPoints};

#[derive(Debug, Clone)]
pub struct MappingOutput {
    /// Optimized graph; node `k` is dominant point `k + 1`.
    pub graph: PoseGraph,
    pub report: OptimizationReport,
    pub circumference: Option<CircumferenceEstimate>,
    /// Hyperparameters used for this run, recalibrated when requested.
    pub hyperparameters: HyperparameterSet,
    pub dominant_points: DominantPoints,
    pub closures: LoopClosureSet,
    pub polygon: Vec<Vector2<f64>>,
}

impl MappingOutput {
    /// Optimized poses, one `[x, y, theta]` column per node.
    pub fn poses(&self) -> &Matrix3xX<f64> {
        &self.graph.poses
    }

    pub fn incidence(&self) -> &CscMatrix<f64> {
        &self.graph.incidence
    }
}

/// Simplifies `path` into dominant points, rejecting paths shorter than 3 points.
pub fn simplify_path(path: &[Vector2<f64>], params: &SimplificationParameters) -> Result<DominantPoints> {
    if path.len() < 3 {
        return Err(MappingError::PathTooShort { len: path.len() });
    }
    let dominant = simplify(path, params.max_deviation, params.min_segment_length);
    log::debug!("simplified {} points to {} dominant points", path.len(), dominant.len());
    Ok(dominant)
}

/// Pose graph over the dominant points `points` with odometry edges and one
/// edge per detected loop closure, initialized by integrating the odometry.
pub fn build_graph(
    points: &[Vector2<f64>],
    detection: &Detection,
    solver: &SolverParameters,
    options: &MappingOptions,
) -> Result<PoseGraph> {
    let poses = dominant_poses(points)?;
    let odometry = measurements_from_poses(&poses);
    let noise = options.noise_model.model(solver.odometry_noise);
    let odometry_information: Vec<Matrix3<f64>> = odometry.iter().map(|z| noise.information(z)).collect();

    let measured = closure_measurements(detection, options.closure_measurement, solver.icp_radius);
    let mut pairs = Vec::with_capacity(measured.len());
    let mut closure_z: Vec<Vector3<f64>> = Vec::with_capacity(measured.len());
    let mut closure_information = Vec::with_capacity(measured.len());
    for (closure, z) in detection.closures.closures.iter().zip(measured) {
        // the first dominant point has no graph node
        let (Some(i), Some(j)) = (closure.from.checked_sub(1), closure.to.checked_sub(1)) else {
            log::warn!("skipping loop closure at the first dominant point");
            continue;
        };
        pairs.push((i, j));
        closure_z.push(z);
        closure_information.push(loop_closure_information(solver.loop_closure_gamma, closure.dissimilarity));
    }

    PoseGraph::from_measurements(
        &poses[0],
        &odometry,
        &odometry_information,
        &pairs,
        &closure_z,
        &closure_information,
    )
}

/// Builds and optimizes the pose graph of one detection.
pub fn solve(
    points: &[Vector2<f64>],
    detection: &Detection,
    solver: &SolverParameters,
    options: &MappingOptions,
) -> Result<(PoseGraph, OptimizationReport)> {
    let mut graph = build_graph(points, detection, solver, options)?;
    let report = graph.optimize(MAX_ITERATIONS);
    Ok((graph, report))
}

/// Node positions of one lap, from the source to the target of the first
/// loop closure, closed by repeating the first vertex. All nodes are used
/// when there is no loop closure.
pub fn map_polygon(graph: &PoseGraph) -> Vec<Vector2<f64>> {
    let (start, end) = graph
        .loop_closure_endpoints()
        .first()
        .copied()
        .unwrap_or((0, graph.num_nodes()));
    let mut polygon: Vec<Vector2<f64>> = (start..end).map(|k| graph.pose(k).xy()).collect();
    if let Some(first) = polygon.first().copied() {
        polygon.push(first);
    }
    polygon
}

/// Maps `path` with `hyperparameters`, recalibrating detector and solver
/// parameters first when `options` ask for it.
pub fn run_mapping(
    path: &[Vector2<f64>],
    hyperparameters: HyperparameterSet,
    options: &MappingOptions,
) -> Result<MappingOutput> {
    let mut hyperparameters = hyperparameters;
    let dominant_points = simplify_path(path, &hyperparameters.simplification)?;
    let points = &dominant_points.points;
    if points.len() < 3 {
        return Err(MappingError::TooFewDominantPoints { len: points.len() });
    }

    if options.calibrate_detector {
        hyperparameters.detector = calibration::calibrate_detector(points, &hyperparameters.detector, options);
    }
    let detection = detect(points, &hyperparameters.detector, options.detection);
    let circumference = estimate_circumference(&detection.closures.arc_lengths());

    if options.calibrate_solver {
        hyperparameters.solver = calibration::calibrate_solver(
            points,
            &detection,
            circumference.as_ref(),
            &hyperparameters.solver,
            options,
        );
    }

    let (graph, report) = solve(points, &detection, &hyperparameters.solver, options)?;
    let polygon = map_polygon(&graph);

    match &circumference {
        Some(estimate) => log::info!(
            "{} loop closures, circumference {:.3} from {} clusters, final error {:.5}",
            detection.closures.len(),
            estimate.circumference,
            estimate.components,
            report.final_error
        ),
        None => {
            log::warn!(
                "{} loop closures, not enough to estimate the circumference",
                detection.closures.len()
            );
            log::info!("final error {:.5}", report.final_error);
        }
    }

    Ok(MappingOutput {
        graph,
        report,
        circumference,
        hyperparameters,
        dominant_points,
        closures: detection.closures,
        polygon,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorParameters;
    use crate::mapping::pose_graph::TerminationReason;
    use std::error::Error;

    /// Densely sampled square of side 10, entered mid-side and closed once.
    fn square_path() -> Vec<Vector2<f64>> {
        let corners = [
            Vector2::new(0.0, 5.0),
            Vector2::new(0.0, 0.0),
            Vector2::new(10.0, 0.0),
            Vector2::new(10.0, 10.0),
            Vector2::new(0.0, 10.0),
            Vector2::new(0.0, 0.0),
            Vector2::new(5.0, 0.0),
        ];
        let mut path = Vec::new();
        for w in corners.windows(2) {
            for k in 0..20 {
                path.push(w[0] + (w[1] - w[0]) * (k as f64 / 20.0));
            }
        }
        path.push(corners[6]);
        path
    }

    fn square_hyperparameters() -> HyperparameterSet {
        HyperparameterSet {
            detector: DetectorParameters {
                neighborhood_length: 3.0,
                max_dissimilarity: 0.1,
                cycle_break_angle: 2.0,
                samples: 21,
            },
            ..Default::default()
        }
    }

    #[test]
    fn short_path_is_fatal() {
        let path = vec![Vector2::new(0.0, 0.0), Vector2::new(1.0, 0.0)];
        assert!(matches!(
            run_mapping(&path, HyperparameterSet::default(), &MappingOptions::default()),
            Err(MappingError::PathTooShort { len: 2 })
        ));
    }

    #[test]
    fn straight_path_has_too_few_dominant_points() {
        let path: Vec<Vector2<f64>> = (0..10).map(|i| Vector2::new(i as f64, 0.0)).collect();
        assert!(matches!(
            run_mapping(&path, HyperparameterSet::default(), &MappingOptions::default()),
            Err(MappingError::TooFewDominantPoints { len: 2 })
        ));
    }

    #[test]
    fn closed_square_maps_with_one_closure() -> std::result::Result<(), Box<dyn Error>> {
        let output = run_mapping(&square_path(), square_hyperparameters(), &MappingOptions::default())?;
        assert_eq!(7, output.dominant_points.len());
        assert_eq!(1, output.closures.len());
        assert!(output.closures.contains(1, 5));

        assert_eq!((6, 6), (output.incidence().nrows(), output.incidence().ncols()));
        assert_eq!(vec![(0, 4)], output.graph.loop_closure_endpoints());

        assert!(output.report.converged);
        assert_eq!(TerminationReason::Converged, output.report.termination_reason);
        assert!(output.report.iterations <= MAX_ITERATIONS);
        approx::assert_abs_diff_eq!(
            Vector3::new(0.0, 0.0, -std::f64::consts::FRAC_PI_2),
            output.graph.pose(0),
            epsilon = 1e-9
        );

        // a single closure cannot give a lap length
        assert!(output.circumference.is_none());

        assert_eq!(5, output.polygon.len());
        approx::assert_abs_diff_eq!(output.polygon[0], output.polygon[4]);
        approx::assert_abs_diff_eq!(Vector2::new(10.0, 10.0), output.polygon[2], epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn hyperparameters_are_handed_back() -> std::result::Result<(), Box<dyn Error>> {
        let params = square_hyperparameters();
        let output = run_mapping(&square_path(), params.clone(), &MappingOptions::default())?;
        assert_eq!(params, output.hyperparameters);
        Ok(())
    }

    #[test]
    fn polygon_without_closures_uses_all_nodes() -> std::result::Result<(), Box<dyn Error>> {
        let mut params = square_hyperparameters();
        params.detector.max_dissimilarity = 0.0;
        let output = run_mapping(&square_path(), params, &MappingOptions::default())?;
        assert!(output.closures.is_empty());
        assert_eq!(output.graph.num_nodes() + 1, output.polygon.len());
        Ok(())
    }
}
