//! Loop-closure detection between dominant points of a closed boundary run.
//!
//! Two dominant points are matched when the path around them has the same
//! local shape. The shape signature is either the turning-angle profile
//! (heading as a function of arc length, centred on its mean so that it is
//! invariant to rotation and translation) or the residual of aligning the two
//! surrounding point windows with ICP.
//!
//! For every candidate row, local minima of the dissimilarity along the row
//! are accepted when they score below the threshold, unless the heading
//! separation of the pair is close to a half turn (regularly repeating
//! geometry) or the two points are only a neighbourhood apart along the path.

use nalgebra::{Isometry2, Point2, Vector2, Vector3};
use rustc_hash::{FxHashMap, FxHashSet};
use std::f64::consts::{PI, TAU};

use crate::config::{ClosureMeasurementMode, DetectionMode, DetectorParameters};
use crate::mapping::icp;
use crate::utils::{interp1, linspace, normalize_angle};

/// Slack when comparing neighbouring scores for a local minimum.
const LOCAL_MIN_TOLERANCE: f64 = 1e-12;
/// Densification steps per window radius of the moving window in aligned
/// closure measurements.
const STEPS_PER_RADIUS: f64 = 10.0;
/// Densification steps per window radius of the fixed window; close to the
/// polyline itself so matches are not pinned to vertices.
const MODEL_STEPS_PER_RADIUS: f64 = 100.0;

/// Arc length and cumulative heading of every dominant point.
///
/// The heading of a dominant point is the unwrapped direction of the segment
/// reaching it; the first point takes the direction of the first segment.
#[derive(Debug, Clone)]
pub struct PathProfile {
    pub points: Vec<Vector2<f64>>,
    pub arc_length: Vec<f64>,
    pub heading: Vec<f64>,
    knots_s: Vec<f64>,
    knots_h: Vec<f64>,
}

impl PathProfile {
    pub fn new(points: &[Vector2<f64>]) -> PathProfile {
        let mut arc_length = Vec::with_capacity(points.len());
        let mut s = 0.0;
        arc_length.push(s);
        for w in points.windows(2) {
            s += (w[1] - w[0]).norm();
            arc_length.push(s);
        }

        let mut segment_heading: Vec<f64> = Vec::with_capacity(points.len().saturating_sub(1));
        for w in points.windows(2) {
            let d = w[1] - w[0];
            let direction = f64::atan2(d.y, d.x);
            let unwrapped = match segment_heading.last() {
                Some(prev) => prev + normalize_angle(direction - prev),
                None => direction,
            };
            segment_heading.push(unwrapped);
        }

        let mut heading = Vec::with_capacity(points.len());
        if let Some(&first) = segment_heading.first() {
            heading.push(first);
            heading.extend(segment_heading.iter().copied());
        }

        // turning function: heading is constant along each segment
        let mut knots_s = Vec::with_capacity(2 * segment_heading.len());
        let mut knots_h = Vec::with_capacity(2 * segment_heading.len());
        for (k, h) in segment_heading.iter().enumerate() {
            knots_s.push(arc_length[k]);
            knots_h.push(*h);
            knots_s.push(arc_length[k + 1]);
            knots_h.push(*h);
        }

        PathProfile {
            points: points.to_vec(),
            arc_length,
            heading,
            knots_s,
            knots_h,
        }
    }

    pub fn total_length(&self) -> f64 {
        self.arc_length.last().copied().unwrap_or(0.0)
    }

    /// Path heading at arc length `s`.
    pub fn heading_at(&self, s: f64) -> f64 {
        interp1(&self.knots_s, &self.knots_h, s)
    }

    /// Mean-centred heading profile sampled at `offsets` around dominant point `i`.
    fn centred_profile(&self, i: usize, offsets: &[f64]) -> Vec<f64> {
        let s = self.arc_length[i];
        let mut profile: Vec<f64> = offsets.iter().map(|o| self.heading_at(s + o)).collect();
        let mean = profile.iter().sum::<f64>() / profile.len() as f64;
        profile.iter_mut().for_each(|h| *h -= mean);
        profile
    }

    /// Dominant points whose neighbourhood lies entirely on the path.
    pub fn candidates(&self, neighborhood_length: f64) -> Vec<usize> {
        let total = self.total_length();
        (0..self.arc_length.len())
            .filter(|&i| {
                let s = self.arc_length[i];
                s > neighborhood_length && total - s > neighborhood_length
            })
            .collect()
    }

    /// Pose of dominant point `i` with its heading wrapped.
    pub fn pose(&self, i: usize) -> Vector3<f64> {
        let p = self.points[i];
        Vector3::new(p.x, p.y, normalize_angle(self.heading[i]))
    }
}

/// Fixed-step densification of the dominant-point polyline.
#[derive(Debug, Clone)]
pub struct ModelPolyline {
    pub points: Vec<Point2<f64>>,
    /// Arc length of every polyline vertex.
    pub arc_length: Vec<f64>,
    /// Polyline vertex of every dominant point.
    pub vertex_of: Vec<usize>,
}

impl ModelPolyline {
    pub fn new(points: &[Vector2<f64>], step: f64) -> ModelPolyline {
        let mut out = Vec::new();
        let mut arc = Vec::new();
        let mut vertex_of = Vec::with_capacity(points.len());
        let mut s = 0.0;
        for w in points.windows(2) {
            let d = w[1] - w[0];
            let len = d.norm();
            let n = if step > 0.0 { (len / step).ceil().max(1.0) as usize } else { 1 };
            vertex_of.push(out.len());
            for k in 0..n {
                let t = k as f64 / n as f64;
                out.push(Point2::from(w[0] + t * d));
                arc.push(s + t * len);
            }
            s += len;
        }
        if let Some(last) = points.last() {
            vertex_of.push(out.len());
            out.push(Point2::from(*last));
            arc.push(s);
        }
        ModelPolyline {
            points: out,
            arc_length: arc,
            vertex_of,
        }
    }

    /// Polyline vertices within `radius` arc length of dominant point `i`,
    /// shrunk to the polyline bounds.
    pub fn window(&self, i: usize, radius: f64) -> &[Point2<f64>] {
        let s = self.arc_length[self.vertex_of[i]];
        let lo = self.arc_length.partition_point(|&a| a < s - radius);
        let hi = self.arc_length.partition_point(|&a| a <= s + radius);
        &self.points[lo..hi.max(lo)]
    }

    /// Window around dominant point `i` expressed in the frame `pose`.
    fn local_window(&self, i: usize, radius: f64, pose: &Vector3<f64>) -> Vec<Point2<f64>> {
        let frame = Isometry2::new(pose.xy(), pose.z).inverse();
        self.window(i, radius).iter().map(|p| frame * p).collect()
    }
}

/// Dissimilarity of ordered dominant-point pairs `(i, j)`, `i <= j`.
#[derive(Debug, Clone, Default)]
pub struct CorrelationMatrix {
    scores: FxHashMap<(usize, usize), f64>,
}

impl CorrelationMatrix {
    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        self.scores.get(&(i.min(j), i.max(j))).copied()
    }

    fn insert(&mut self, i: usize, j: usize, score: f64) {
        self.scores.insert((i.min(j), i.max(j)), score);
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// An accepted pair of dominant points, `from < to`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopClosure {
    pub from: usize,
    pub to: usize,
    pub dissimilarity: f64,
    /// Arc length travelled between the two points.
    pub arc_length: f64,
    /// Cumulative heading change between the two points.
    pub heading: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LoopClosureSet {
    adjacency: FxHashSet<(usize, usize)>,
    pub closures: Vec<LoopClosure>,
}

impl LoopClosureSet {
    fn push(&mut self, closure: LoopClosure) {
        self.adjacency.insert((closure.from, closure.to));
        self.closures.push(closure);
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.adjacency.contains(&(i.min(j), i.max(j)))
    }

    pub fn len(&self) -> usize {
        self.closures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closures.is_empty()
    }

    /// Arc-length separations of the accepted pairs.
    pub fn arc_lengths(&self) -> Vec<f64> {
        self.closures.iter().map(|c| c.arc_length).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub profile: PathProfile,
    pub correlation: CorrelationMatrix,
    pub closures: LoopClosureSet,
}

fn mean_squared_difference(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>() / a.len() as f64
}

fn is_local_minimum(row: &[f64], k: usize) -> bool {
    let d = row[k];
    let left = k == 0 || d <= row[k - 1] + LOCAL_MIN_TOLERANCE;
    let right = k + 1 == row.len() || d <= row[k + 1] + LOCAL_MIN_TOLERANCE;
    left && right
}

/// Half turn test on the heading separation of a pair.
fn is_near_reversal(heading_separation: f64, cycle_break_angle: f64) -> bool {
    (heading_separation.rem_euclid(TAU) - PI).abs() < cycle_break_angle
}

fn correlation_scores(
    profile: &PathProfile,
    candidates: &[usize],
    params: &DetectorParameters,
) -> CorrelationMatrix {
    let l_nh = params.neighborhood_length;
    let offsets = linspace(-l_nh, l_nh, params.samples.max(2));
    let profiles: Vec<Vec<f64>> = candidates
        .iter()
        .map(|&i| profile.centred_profile(i, &offsets))
        .collect();

    let mut matrix = CorrelationMatrix::default();
    for (a, &i) in candidates.iter().enumerate() {
        for (b, &j) in candidates.iter().enumerate().skip(a) {
            matrix.insert(i, j, mean_squared_difference(&profiles[a], &profiles[b]));
        }
    }
    matrix
}

fn icp_scores(
    profile: &PathProfile,
    candidates: &[usize],
    params: &DetectorParameters,
) -> CorrelationMatrix {
    let l_nh = params.neighborhood_length;
    let step = 2.0 * l_nh / (params.samples.max(2) - 1) as f64;
    let model = ModelPolyline::new(&profile.points, step);
    let windows: Vec<Vec<Point2<f64>>> = candidates
        .iter()
        .map(|&i| model.local_window(i, l_nh, &profile.pose(i)))
        .collect();

    let mut matrix = CorrelationMatrix::default();
    for (a, &i) in candidates.iter().enumerate() {
        for (b, &j) in candidates.iter().enumerate().skip(a) {
            let score = icp::align(&windows[a], &windows[b], Isometry2::identity())
                .map_or(f64::INFINITY, |alignment| alignment.residual);
            matrix.insert(i, j, score);
        }
    }
    matrix
}

/// Detects loop closures among the dominant points `points`.
pub fn detect(points: &[Vector2<f64>], params: &DetectorParameters, mode: DetectionMode) -> Detection {
    let profile = PathProfile::new(points);
    let l_nh = params.neighborhood_length;
    let candidates = profile.candidates(l_nh);

    let correlation = match mode {
        DetectionMode::Correlation => correlation_scores(&profile, &candidates, params),
        DetectionMode::Icp => icp_scores(&profile, &candidates, params),
    };

    let mut closures = LoopClosureSet::default();
    for (a, &i) in candidates.iter().enumerate() {
        let columns = &candidates[a..];
        let row: Vec<f64> = columns
            .iter()
            .map(|&j| correlation.get(i, j).unwrap_or(f64::INFINITY))
            .collect();

        for (k, &j) in columns.iter().enumerate() {
            let score = row[k];
            if !(score < params.max_dissimilarity) || !is_local_minimum(&row, k) {
                continue;
            }
            let heading = profile.heading[j] - profile.heading[i];
            let arc_length = profile.arc_length[j] - profile.arc_length[i];
            if is_near_reversal(heading, params.cycle_break_angle) || arc_length <= 2.0 * l_nh {
                continue;
            }
            closures.push(LoopClosure {
                from: i,
                to: j,
                dissimilarity: score,
                arc_length,
                heading,
            });
        }
    }

    log::debug!(
        "{} candidates, {} scored pairs, {} loop closures",
        candidates.len(),
        correlation.len(),
        closures.len()
    );

    Detection {
        profile,
        correlation,
        closures,
    }
}

/// Relative pose `[dx, dy, dtheta]` of the `to` point in the frame of the
/// `from` point for every closure.
pub fn closure_measurements(
    detection: &Detection,
    mode: ClosureMeasurementMode,
    icp_radius: f64,
) -> Vec<Vector3<f64>> {
    match mode {
        ClosureMeasurementMode::Coincident => vec![Vector3::zeros(); detection.closures.len()],
        ClosureMeasurementMode::Aligned => {
            let points = &detection.profile.points;
            let model = ModelPolyline::new(points, icp_radius / MODEL_STEPS_PER_RADIUS);
            let test = ModelPolyline::new(points, icp_radius / STEPS_PER_RADIUS);
            detection
                .closures
                .closures
                .iter()
                .map(|c| {
                    let pose_i = detection.profile.pose(c.from);
                    let pose_j = detection.profile.pose(c.to);
                    let window_i = model.local_window(c.from, icp_radius, &pose_i);
                    let window_j = test.local_window(c.to, icp_radius, &pose_j);
                    match icp::align(&window_i, &window_j, Isometry2::identity()) {
                        Some(alignment) => {
                            let t = alignment.transform;
                            Vector3::new(
                                t.translation.x,
                                t.translation.y,
                                normalize_angle(t.rotation.angle()),
                            )
                        }
                        None => Vector3::zeros(),
                    }
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::measurement::relative_pose;
    use std::f64::consts::FRAC_PI_2;

    /// Square of side 10 entered mid-side, closed once and left mid-side.
    fn square_loop() -> Vec<Vector2<f64>> {
        vec![
            Vector2::new(0.0, 5.0),
            Vector2::new(0.0, 0.0),
            Vector2::new(10.0, 0.0),
            Vector2::new(10.0, 10.0),
            Vector2::new(0.0, 10.0),
            Vector2::new(0.0, 0.0),
            Vector2::new(5.0, 0.0),
        ]
    }

    fn params() -> DetectorParameters {
        DetectorParameters {
            neighborhood_length: 3.0,
            max_dissimilarity: 0.1,
            cycle_break_angle: 2.0,
            samples: 21,
        }
    }

    #[test]
    fn profile_unwraps_heading() {
        let profile = PathProfile::new(&square_loop());
        approx::assert_abs_diff_eq!(45.0, profile.arc_length[5]);
        approx::assert_abs_diff_eq!(50.0, profile.total_length());
        approx::assert_abs_diff_eq!(-FRAC_PI_2, profile.heading[1], epsilon = 1e-12);
        approx::assert_abs_diff_eq!(1.5 * PI, profile.heading[5], epsilon = 1e-12);
        approx::assert_abs_diff_eq!(0.0, profile.heading_at(7.0), epsilon = 1e-12);
        assert_eq!(vec![1, 2, 3, 4, 5], profile.candidates(3.0));
        approx::assert_abs_diff_eq!(profile.pose(1), profile.pose(5), epsilon = 1e-12);
        approx::assert_abs_diff_eq!(Vector3::new(0.0, 0.0, -FRAC_PI_2), profile.pose(1), epsilon = 1e-12);
    }

    #[test]
    fn square_loop_closes_once_at_the_revisited_corner() {
        let detection = detect(&square_loop(), &params(), DetectionMode::Correlation);
        assert_eq!(1, detection.closures.len());
        let closure = &detection.closures.closures[0];
        assert_eq!((1, 5), (closure.from, closure.to));
        assert!(detection.closures.contains(5, 1));
        approx::assert_abs_diff_eq!(40.0, closure.arc_length);
        approx::assert_abs_diff_eq!(TAU, closure.heading, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(0.0, closure.dissimilarity, epsilon = 1e-12);
    }

    #[test]
    fn corners_of_one_lap_are_not_matched() {
        // every corner looks alike, only the full turn survives the reversal filter
        let detection = detect(&square_loop(), &params(), DetectionMode::Correlation);
        approx::assert_abs_diff_eq!(0.0, detection.correlation.get(1, 2).unwrap(), epsilon = 1e-12);
        assert!(!detection.closures.contains(1, 2));
        assert!(!detection.closures.contains(2, 4));
    }

    #[test]
    fn zero_threshold_yields_no_closures() {
        let mut params = params();
        params.max_dissimilarity = 0.0;
        for mode in [DetectionMode::Correlation, DetectionMode::Icp] {
            let detection = detect(&square_loop(), &params, mode);
            assert!(detection.closures.is_empty());
        }

        let zigzag: Vec<Vector2<f64>> = (0..60)
            .map(|i| Vector2::new(i as f64, if i % 3 == 0 { 1.0 } else { 0.0 }))
            .collect();
        assert!(detect(&zigzag, &params, DetectionMode::Correlation).closures.is_empty());
    }

    #[test]
    fn icp_detection_matches_revisited_corner() {
        let detection = detect(&square_loop(), &params(), DetectionMode::Icp);
        assert!(detection.closures.contains(1, 5));
        approx::assert_abs_diff_eq!(0.0, detection.correlation.get(1, 5).unwrap(), epsilon = 1e-9);
    }

    #[test]
    fn straight_corridor_rejects_adjacent_matches() {
        let line: Vec<Vector2<f64>> = (0..30).map(|i| Vector2::new(i as f64, 0.0)).collect();
        let mut params = params();
        params.cycle_break_angle = 0.5;
        let detection = detect(&line, &params, DetectionMode::Correlation);
        for c in &detection.closures.closures {
            assert!(c.arc_length > 2.0 * params.neighborhood_length);
        }
    }

    #[test]
    fn model_window_shrinks_at_path_ends() {
        let model = ModelPolyline::new(&square_loop(), 0.5);
        assert_eq!(model.points.len(), model.arc_length.len());
        let window = model.window(0, 3.0);
        approx::assert_abs_diff_eq!(Point2::new(0.0, 5.0), window[0]);
        assert_eq!(7, window.len());
        let last = model.window(6, 3.0);
        approx::assert_abs_diff_eq!(Point2::new(5.0, 0.0), *last.last().unwrap());
    }

    #[test]
    fn aligned_measurement_of_exact_revisit_is_identity() {
        let points = square_loop();
        let detection = detect(&points, &params(), DetectionMode::Correlation);
        let z = closure_measurements(&detection, ClosureMeasurementMode::Aligned, 3.0);
        assert_eq!(1, z.len());
        approx::assert_abs_diff_eq!(Vector3::zeros(), z[0], epsilon = 1e-3);
    }

    #[test]
    fn aligned_measurement_locates_revisit_in_first_visit_frame() {
        // second visit turns at the same corner but its dominant point sits 0.3 before it
        let points = vec![
            Vector2::new(0.0, 5.0),
            Vector2::new(0.0, 0.0),
            Vector2::new(10.0, 0.0),
            Vector2::new(10.0, 10.0),
            Vector2::new(0.0, 10.0),
            Vector2::new(0.0, 0.3),
            Vector2::new(0.0, 0.0),
            Vector2::new(5.0, 0.0),
        ];
        let profile = PathProfile::new(&points);
        let mut closures = LoopClosureSet::default();
        closures.push(LoopClosure {
            from: 1,
            to: 5,
            dissimilarity: 0.0,
            arc_length: profile.arc_length[5] - profile.arc_length[1],
            heading: profile.heading[5] - profile.heading[1],
        });
        let detection = Detection {
            profile,
            correlation: CorrelationMatrix::default(),
            closures,
        };

        let aligned = closure_measurements(&detection, ClosureMeasurementMode::Aligned, 3.0);
        let coincident = closure_measurements(&detection, ClosureMeasurementMode::Coincident, 3.0);
        let expected = relative_pose(&detection.profile.pose(1), &detection.profile.pose(5));
        approx::assert_abs_diff_eq!(Vector3::new(-0.3, 0.0, 0.0), expected, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(expected, aligned[0], epsilon = 0.02);
        approx::assert_abs_diff_eq!(Vector3::zeros(), coincident[0]);
    }

    #[test]
    fn icp_detection_pairs_corners_of_noisy_irregular_laps() {
        let corners = [
            Vector2::new(8.1, 0.0),
            Vector2::new(10.0, 5.0),
            Vector2::new(4.0, 9.0),
            Vector2::new(-1.0, 5.0),
            Vector2::new(0.0, 0.0),
        ];
        let noise = [
            Vector2::new(0.004, -0.003),
            Vector2::new(-0.002, 0.004),
            Vector2::new(0.003, 0.002),
            Vector2::new(-0.004, -0.001),
            Vector2::new(0.002, 0.003),
        ];
        let mut points = vec![Vector2::new(4.0, 0.0)];
        points.extend(corners.iter());
        points.extend(corners.iter().zip(noise.iter()).map(|(c, n)| c + n));
        points.push(Vector2::new(4.0, 0.0));

        let params = DetectorParameters {
            neighborhood_length: 2.0,
            max_dissimilarity: 0.1,
            cycle_break_angle: 2.5,
            samples: 21,
        };
        let detection = detect(&points, &params, DetectionMode::Icp);
        let pairs: Vec<(usize, usize)> = detection.closures.closures.iter().map(|c| (c.from, c.to)).collect();
        assert_eq!(vec![(1, 6), (2, 7), (3, 8), (4, 9), (5, 10)], pairs);
        for c in &detection.closures.closures {
            assert!(c.dissimilarity < 1e-3, "{c:?}");
            approx::assert_abs_diff_eq!(TAU, c.heading, epsilon = 1e-2);
            // a neighbouring corner of the other lap fits worse
            assert!(detection.correlation.get(c.from, c.to - 1).unwrap() > c.dissimilarity);
        }
    }
}
