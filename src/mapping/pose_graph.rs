#![allow(non_snake_case)]

//! SE2 pose graph over dominant points and its Gauss-Newton solver.
//!
//! The graph minimizes
//!
//! ```text
//! F(x) = Σ e(xi, xj, zij)^T * Ωij * e(xi, xj, zij)
//! ```
//!
//! by repeatedly solving `H * dx = -b` with `H = Σ J^T Ω J` and
//! `b = Σ J^T Ω e`. Edge endpoints are read from the incidence matrix, one
//! column per edge with `-1` at the source node and `+1` at the target node.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3xX, Vector3};
use nalgebra_sparse::{factorization::CscCholesky, CooMatrix, CscMatrix};

use crate::error::{MappingError, Result};
use crate::mapping::measurement::integrate;
use crate::models::measurement::{MeasurementModel, RelativePoseModel};
use crate::models::motion::MIN_INFORMATION;
use crate::utils::normalize_angle;

/// Iteration cap of the Gauss-Newton loop.
pub const MAX_ITERATIONS: usize = 100;
/// The loop stops once `|dx|` falls below this value.
pub const TOLERANCE: f64 = 1e-4;
/// Smallest detector score used when weighting a loop closure.
pub const MIN_DISSIMILARITY: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Odometry,
    LoopClosure,
}

#[derive(Debug, Clone)]
pub struct EdgeSE2 {
    pub measurement: Vector3<f64>,
    pub information: Matrix3<f64>,
    pub kind: EdgeKind,
}

impl EdgeSE2 {
    pub fn new(measurement: Vector3<f64>, information: Matrix3<f64>, kind: EdgeKind) -> EdgeSE2 {
        EdgeSE2 {
            measurement,
            information,
            kind,
        }
    }
}

/// Reason for optimization termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// `|dx|` fell below the tolerance.
    Converged,
    MaxIterations,
    /// The increment contained NaN or infinite values and was discarded.
    NonFinite,
    /// Neither the sparse Cholesky nor the dense LU factorization succeeded.
    SolveFailed,
    NoEdges,
}

#[derive(Debug, Clone)]
pub struct OptimizationReport {
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    /// Weighted squared error before the first and after every applied step.
    pub errors: Vec<f64>,
    pub converged: bool,
    pub termination_reason: TerminationReason,
}

/// Precision of a loop closure: `diag(1/γ1, 1/γ1, 1/γ2)` divided by the
/// detector dissimilarity of the pair.
pub fn loop_closure_information(gamma: [f64; 2], dissimilarity: f64) -> Matrix3<f64> {
    let scale = 1.0 / dissimilarity.max(MIN_DISSIMILARITY);
    let [g1, g2] = gamma.map(|g| g.max(f64::MIN_POSITIVE));
    Matrix3::from_diagonal(&Vector3::new(scale / g1, scale / g1, scale / g2).map(|v| v.max(MIN_INFORMATION)))
}

/// Incidence matrix of `num_nodes` nodes and one column per `(source, target)` pair.
pub fn incidence_matrix(num_nodes: usize, pairs: &[(usize, usize)]) -> Result<CscMatrix<f64>> {
    let mut coo = CooMatrix::new(num_nodes, pairs.len());
    for (col, &(from, to)) in pairs.iter().enumerate() {
        let out_of_range = from.max(to);
        if out_of_range >= num_nodes {
            return Err(MappingError::SizeMismatch {
                what: "edge endpoint",
                expected: num_nodes,
                found: out_of_range + 1,
            });
        }
        if from == to {
            return Err(MappingError::SizeMismatch {
                what: "distinct edge endpoints",
                expected: 2,
                found: 1,
            });
        }
        coo.push(from, col, -1.0);
        coo.push(to, col, 1.0);
    }
    Ok(CscMatrix::from(&coo))
}

fn endpoints(incidence: &CscMatrix<f64>) -> Vec<(usize, usize)> {
    (0..incidence.ncols())
        .map(|c| {
            let col = incidence.col(c);
            let mut from = 0;
            let mut to = 0;
            for (&row, &value) in col.row_indices().iter().zip(col.values()) {
                if value < 0.0 {
                    from = row;
                } else {
                    to = row;
                }
            }
            (from, to)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PoseGraph {
    /// One column `[x, y, theta]` per node.
    pub poses: Matrix3xX<f64>,
    pub incidence: CscMatrix<f64>,
    pub edges: Vec<EdgeSE2>,
    endpoints: Vec<(usize, usize)>,
}

impl PoseGraph {
    /// Graph over explicit node poses and edges connecting `pairs`.
    pub fn new(poses: Matrix3xX<f64>, pairs: &[(usize, usize)], edges: Vec<EdgeSE2>) -> Result<PoseGraph> {
        if pairs.len() != edges.len() {
            return Err(MappingError::SizeMismatch {
                what: "edge measurements",
                expected: pairs.len(),
                found: edges.len(),
            });
        }
        let incidence = incidence_matrix(poses.ncols(), pairs)?;
        let endpoints = endpoints(&incidence);
        let mut poses = poses;
        for mut pose in poses.column_iter_mut() {
            pose[2] = normalize_angle(pose[2]);
        }
        Ok(PoseGraph {
            poses,
            incidence,
            edges,
            endpoints,
        })
    }

    /// Chain of odometry edges plus loop-closure edges between node pairs.
    ///
    /// The initial guess integrates the odometry from `origin`.
    pub fn from_measurements(
        origin: &Vector3<f64>,
        odometry: &[Vector3<f64>],
        odometry_information: &[Matrix3<f64>],
        closures: &[(usize, usize)],
        closure_measurements: &[Vector3<f64>],
        closure_information: &[Matrix3<f64>],
    ) -> Result<PoseGraph> {
        if odometry.len() != odometry_information.len() {
            return Err(MappingError::SizeMismatch {
                what: "odometry information matrices",
                expected: odometry.len(),
                found: odometry_information.len(),
            });
        }
        if closures.len() != closure_measurements.len() {
            return Err(MappingError::SizeMismatch {
                what: "loop-closure measurements",
                expected: closures.len(),
                found: closure_measurements.len(),
            });
        }
        if closures.len() != closure_information.len() {
            return Err(MappingError::SizeMismatch {
                what: "loop-closure information matrices",
                expected: closures.len(),
                found: closure_information.len(),
            });
        }

        let initial = integrate(origin, odometry);
        let poses = Matrix3xX::from_columns(&initial);

        let mut pairs: Vec<(usize, usize)> = (0..odometry.len()).map(|k| (k, k + 1)).collect();
        pairs.extend_from_slice(closures);

        let mut edges: Vec<EdgeSE2> = odometry
            .iter()
            .zip(odometry_information)
            .map(|(z, omega)| EdgeSE2::new(*z, *omega, EdgeKind::Odometry))
            .collect();
        edges.extend(
            closure_measurements
                .iter()
                .zip(closure_information)
                .map(|(z, omega)| EdgeSE2::new(*z, *omega, EdgeKind::LoopClosure)),
        );

        PoseGraph::new(poses, &pairs, edges)
    }

    pub fn num_nodes(&self) -> usize {
        self.poses.ncols()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// `(source, target)` nodes of edge `e`.
    pub fn endpoints(&self, e: usize) -> (usize, usize) {
        self.endpoints[e]
    }

    /// `(source, target)` nodes of every loop-closure edge, in edge order.
    pub fn loop_closure_endpoints(&self) -> Vec<(usize, usize)> {
        self.edges
            .iter()
            .zip(&self.endpoints)
            .filter(|(edge, _)| edge.kind == EdgeKind::LoopClosure)
            .map(|(_, &pair)| pair)
            .collect()
    }

    pub fn pose(&self, i: usize) -> Vector3<f64> {
        self.poses.column(i).into_owned()
    }

    /// Path length travelled from node `i` to node `j` through the intermediate nodes.
    pub fn traversed_length(&self, i: usize, j: usize) -> f64 {
        let (lo, hi) = (i.min(j), i.max(j));
        (lo..hi)
            .map(|k| (self.pose(k + 1).xy() - self.pose(k).xy()).norm())
            .sum()
    }

    pub fn global_error(&self) -> f64 {
        self.edges
            .iter()
            .enumerate()
            .map(|(e, edge)| {
                let (i, j) = self.endpoints[e];
                let err = RelativePoseModel.error(&edge.measurement, &self.pose(i), &self.pose(j));
                (err.transpose() * edge.information * err).x
            })
            .sum()
    }

    fn build_linear_system(&self) -> (DMatrix<f64>, DVector<f64>) {
        let n = 3 * self.num_nodes();
        let mut H = DMatrix::zeros(n, n);
        let mut b = DVector::zeros(n);

        for (e, edge) in self.edges.iter().enumerate() {
            let (i, j) = self.endpoints[e];
            let (xi, xj) = (self.pose(i), self.pose(j));
            let z = &edge.measurement;
            let omega = &edge.information;

            let err = RelativePoseModel.error(z, &xi, &xj);
            let (A, B) = RelativePoseModel.jacobian(z, &xi, &xj);

            let b_i = A.transpose() * omega * err;
            let b_j = B.transpose() * omega * err;

            let h_ii = A.transpose() * omega * A;
            let h_ij = A.transpose() * omega * B;
            let h_ji = h_ij.transpose();
            let h_jj = B.transpose() * omega * B;

            let (from_idx, to_idx) = (3 * i, 3 * j);
            let mut v = H.fixed_view_mut::<3, 3>(from_idx, from_idx);
            v += h_ii;
            let mut v = H.fixed_view_mut::<3, 3>(from_idx, to_idx);
            v += h_ij;
            let mut v = H.fixed_view_mut::<3, 3>(to_idx, from_idx);
            v += h_ji;
            let mut v = H.fixed_view_mut::<3, 3>(to_idx, to_idx);
            v += h_jj;

            let mut v = b.fixed_rows_mut::<3>(from_idx);
            v += b_i;
            let mut v = b.fixed_rows_mut::<3>(to_idx);
            v += b_j;
        }

        // anchor the first node to remove the gauge freedom
        let mut v = H.fixed_view_mut::<3, 3>(0, 0);
        v += Matrix3::identity();

        (H, b)
    }

    fn solve(H: DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
        let rhs = DMatrix::from_column_slice(b.len(), 1, (-b).as_slice());
        match CscCholesky::factor(&CscMatrix::from(&H)) {
            Ok(cholesky) => Some(cholesky.solve(&rhs).column(0).into_owned()),
            Err(err) => {
                log::debug!("sparse cholesky failed ({err:?}), falling back to dense LU");
                H.lu().solve(&(-b))
            }
        }
    }

    /// Linearizes all edges once and returns the Gauss-Newton increment.
    pub fn linearize_and_solve(&self) -> Option<DVector<f64>> {
        let (H, b) = self.build_linear_system();
        PoseGraph::solve(H, &b)
    }

    fn update_nodes(&mut self, dx: &DVector<f64>) {
        for (k, mut pose) in self.poses.column_iter_mut().enumerate() {
            pose += dx.fixed_rows::<3>(3 * k);
            pose[2] = normalize_angle(pose[2]);
        }
    }

    /// Gauss-Newton iterations until `|dx| <` [`TOLERANCE`] or `max_iterations`.
    pub fn optimize(&mut self, max_iterations: usize) -> OptimizationReport {
        let initial_error = self.global_error();
        let mut errors = vec![initial_error];
        log::info!(
            "optimizing graph with {} nodes and {} edges, initial error {:.5}",
            self.num_nodes(),
            self.num_edges(),
            initial_error
        );

        if self.edges.is_empty() {
            return OptimizationReport {
                iterations: 0,
                initial_error,
                final_error: initial_error,
                errors,
                converged: true,
                termination_reason: TerminationReason::NoEdges,
            };
        }

        let mut termination_reason = TerminationReason::MaxIterations;
        let mut iterations = 0;
        for i in 0..max_iterations {
            iterations = i + 1;
            let Some(dx) = self.linearize_and_solve() else {
                log::warn!("step {i:3} : linear system could not be solved");
                termination_reason = TerminationReason::SolveFailed;
                break;
            };
            if dx.iter().any(|v| !v.is_finite()) {
                log::warn!("step {i:3} : non-finite increment, keeping last finite poses");
                termination_reason = TerminationReason::NonFinite;
                break;
            }

            self.update_nodes(&dx);
            let norm_dx = dx.norm();
            let error = self.global_error();
            errors.push(error);
            log::debug!("step {i:3} : |dx| = {norm_dx:3.5}, error = {error:3.5}");

            if norm_dx < TOLERANCE {
                termination_reason = TerminationReason::Converged;
                break;
            }
        }

        let final_error = errors.last().copied().unwrap_or(initial_error);
        if termination_reason == TerminationReason::MaxIterations {
            log::warn!("no convergence after {iterations} iterations, error {final_error:.5}");
        }
        OptimizationReport {
            iterations,
            initial_error,
            final_error,
            errors,
            converged: termination_reason == TerminationReason::Converged,
            termination_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::measurement::relative_pose;
    use std::error::Error;
    use std::f64::consts::FRAC_PI_2;

    /// Four quarter turns of side `side`, returning to the start.
    fn square_odometry(side: f64) -> Vec<Vector3<f64>> {
        vec![Vector3::new(side, 0.0, FRAC_PI_2); 4]
    }

    fn unit_information(n: usize) -> Vec<Matrix3<f64>> {
        vec![Matrix3::identity(); n]
    }

    #[test]
    fn incidence_columns_have_one_source_and_one_target() -> std::result::Result<(), Box<dyn Error>> {
        let pairs = [(0, 1), (1, 2), (2, 3), (0, 3), (1, 3)];
        let incidence = incidence_matrix(4, &pairs)?;
        assert_eq!((4, 5), (incidence.nrows(), incidence.ncols()));
        for (c, &(from, to)) in pairs.iter().enumerate() {
            let col = incidence.col(c);
            assert_eq!(2, col.nnz());
            assert_eq!(0.0, col.values().iter().sum::<f64>());
            assert_eq!(1, col.values().iter().filter(|&&v| v == -1.0).count());
            assert_eq!(1, col.values().iter().filter(|&&v| v == 1.0).count());
            assert_eq!(Some(-1.0), col.get_entry(from).map(|e| e.into_value()));
            assert_eq!(Some(1.0), col.get_entry(to).map(|e| e.into_value()));
        }
        Ok(())
    }

    #[test]
    fn invalid_endpoints_are_rejected() {
        assert!(matches!(
            incidence_matrix(3, &[(0, 3)]),
            Err(MappingError::SizeMismatch { .. })
        ));
        assert!(incidence_matrix(3, &[(1, 1)]).is_err());
    }

    #[test]
    fn measurement_count_mismatch_is_fatal() {
        let odometry = square_odometry(2.0);
        let result = PoseGraph::from_measurements(
            &Vector3::zeros(),
            &odometry,
            &unit_information(4),
            &[(0, 4)],
            &[],
            &unit_information(1),
        );
        assert!(matches!(result, Err(MappingError::SizeMismatch { .. })));
    }

    #[test]
    fn graph_layout_follows_odometry_chain() -> std::result::Result<(), Box<dyn Error>> {
        let graph = PoseGraph::from_measurements(
            &Vector3::zeros(),
            &square_odometry(2.0),
            &unit_information(4),
            &[(0, 4)],
            &[Vector3::zeros()],
            &unit_information(1),
        )?;
        assert_eq!(5, graph.num_nodes());
        assert_eq!(5, graph.num_edges());
        assert_eq!((1, 2), graph.endpoints(1));
        assert_eq!((0, 4), graph.endpoints(4));
        assert_eq!(EdgeKind::LoopClosure, graph.edges[4].kind);
        approx::assert_abs_diff_eq!(8.0, graph.traversed_length(0, 4), epsilon = 1e-9);
        for pose in graph.poses.column_iter() {
            assert!(pose[2] > -std::f64::consts::PI && pose[2] <= std::f64::consts::PI);
        }
        Ok(())
    }

    #[test]
    fn consistent_graph_converges_immediately_and_keeps_anchor() -> std::result::Result<(), Box<dyn Error>> {
        let origin = Vector3::new(1.0, -2.0, 0.3);
        let mut graph = PoseGraph::from_measurements(
            &origin,
            &square_odometry(5.0),
            &unit_information(4),
            &[(0, 4)],
            &[Vector3::zeros()],
            &unit_information(1),
        )?;
        approx::assert_abs_diff_eq!(0.0, graph.global_error(), epsilon = 1e-12);
        let report = graph.optimize(MAX_ITERATIONS);
        assert!(report.converged);
        assert_eq!(1, report.iterations);
        approx::assert_abs_diff_eq!(origin, graph.pose(0), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn loop_closure_removes_drift() -> std::result::Result<(), Box<dyn Error>> {
        // each quarter turn overshoots a little, so the chain does not close
        let odometry = vec![Vector3::new(5.0, 0.1, FRAC_PI_2 + 0.05); 4];
        let odometry_information = vec![Matrix3::from_diagonal(&Vector3::new(10.0, 10.0, 100.0)); 4];
        let closure_information = loop_closure_information([0.001, 0.001], 1.0);
        let mut graph = PoseGraph::from_measurements(
            &Vector3::zeros(),
            &odometry,
            &odometry_information,
            &[(0, 4)],
            &[Vector3::zeros()],
            &[closure_information],
        )?;
        let gap_before = relative_pose(&graph.pose(0), &graph.pose(4)).norm();

        let report = graph.optimize(MAX_ITERATIONS);
        assert!(report.converged, "{report:?}");
        assert!(report.final_error < report.initial_error);
        let gap_after = relative_pose(&graph.pose(0), &graph.pose(4)).norm();
        assert!(gap_after < 0.1 * gap_before, "{gap_before} -> {gap_after}");
        for pose in graph.poses.column_iter() {
            assert!(pose[2] > -std::f64::consts::PI && pose[2] <= std::f64::consts::PI);
        }
        Ok(())
    }

    #[test]
    fn graph_without_edges_reports_no_edges() -> std::result::Result<(), Box<dyn Error>> {
        let mut graph = PoseGraph::new(Matrix3xX::zeros(1), &[], Vec::new())?;
        let report = graph.optimize(MAX_ITERATIONS);
        assert_eq!(TerminationReason::NoEdges, report.termination_reason);
        Ok(())
    }

    #[test]
    fn non_finite_measurement_stops_without_corrupting_poses() -> std::result::Result<(), Box<dyn Error>> {
        let mut graph = PoseGraph::from_measurements(
            &Vector3::zeros(),
            &[Vector3::new(1.0, 0.0, 0.0), Vector3::new(f64::NAN, 0.0, 0.0)],
            &unit_information(2),
            &[],
            &[],
            &[],
        )?;
        let before = graph.pose(1);
        let report = graph.optimize(MAX_ITERATIONS);
        assert!(!report.converged);
        assert!(matches!(
            report.termination_reason,
            TerminationReason::NonFinite | TerminationReason::SolveFailed
        ));
        approx::assert_abs_diff_eq!(before, graph.pose(1));
        Ok(())
    }

    #[test]
    fn loop_closure_precision_scales_with_score() {
        let strong = loop_closure_information([0.1, 0.05], 0.01);
        let weak = loop_closure_information([0.1, 0.05], 0.1);
        approx::assert_abs_diff_eq!(1000.0, strong[(0, 0)], epsilon = 1e-9);
        approx::assert_abs_diff_eq!(2000.0, strong[(2, 2)], epsilon = 1e-9);
        assert!(weak[(0, 0)] < strong[(0, 0)]);
        let floored = loop_closure_information([0.1, 0.05], 0.0);
        assert!(floored[(0, 0)].is_finite());
    }
}
