//! Odometry measurements between consecutive dominant points.
//!
//! The heading of a dominant point is the direction of the segment that
//! reaches it, so the first dominant point carries no pose and the graph
//! nodes are dominant points `1..M`. Node `k` is dominant point `k + 1`.

use nalgebra::{Vector2, Vector3};

use crate::error::{MappingError, Result};
use crate::models::measurement::{compose, relative_pose};

/// Poses `[x, y, heading]` of dominant points `1..M`.
pub fn dominant_poses(points: &[Vector2<f64>]) -> Result<Vec<Vector3<f64>>> {
    if points.len() < 3 {
        return Err(MappingError::TooFewDominantPoints { len: points.len() });
    }
    Ok(points
        .windows(2)
        .map(|w| {
            let d = w[1] - w[0];
            Vector3::new(w[1].x, w[1].y, f64::atan2(d.y, d.x))
        })
        .collect())
}

/// Relative-pose measurements `[dx, dy, dtheta]` between consecutive poses.
pub fn measurements_from_poses(poses: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    poses
        .windows(2)
        .map(|w| relative_pose(&w[0], &w[1]))
        .collect()
}

/// One odometry measurement per pair of consecutive graph nodes.
pub fn generate_measurements(points: &[Vector2<f64>]) -> Result<Vec<Vector3<f64>>> {
    Ok(measurements_from_poses(&dominant_poses(points)?))
}

/// Forward-integrates `measurements` from `origin`, returning one more pose
/// than there are measurements.
pub fn integrate(origin: &Vector3<f64>, measurements: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    let mut poses = Vec::with_capacity(measurements.len() + 1);
    poses.push(*origin);
    let mut x = *origin;
    for z in measurements {
        x = compose(&x, z);
        poses.push(x);
    }
    poses
}
