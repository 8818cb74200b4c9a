#![allow(non_snake_case)]

use nalgebra::{Matrix3, Rotation2, Vector2, Vector3};

use crate::utils::normalize_angle;

/// Forward-difference step used for numerical Jacobians.
pub const JACOBIAN_STEP: f64 = 1e-6;

/// Model of a pose-pose constraint between two SE2 poses `[x, y, theta]`.
pub trait MeasurementModel {
    /// Expected measurement given the two endpoint poses.
    fn prediction(&self, xi: &Vector3<f64>, xj: &Vector3<f64>) -> Vector3<f64>;

    /// `z - prediction`, with the rotational part wrapped to (-pi, pi].
    fn error(&self, z: &Vector3<f64>, xi: &Vector3<f64>, xj: &Vector3<f64>) -> Vector3<f64> {
        let mut e = z - self.prediction(xi, xj);
        e.z = normalize_angle(e.z);
        e
    }

    /// Jacobians of the error with respect to `xi` and `xj` by forward differences.
    fn jacobian(
        &self,
        z: &Vector3<f64>,
        xi: &Vector3<f64>,
        xj: &Vector3<f64>,
    ) -> (Matrix3<f64>, Matrix3<f64>) {
        let e = self.error(z, xi, xj);
        let mut A = Matrix3::zeros();
        let mut B = Matrix3::zeros();
        for k in 0..3 {
            let mut xi_h = *xi;
            xi_h[k] += JACOBIAN_STEP;
            let mut de = self.error(z, &xi_h, xj) - e;
            de.z = normalize_angle(de.z);
            A.set_column(k, &(de / JACOBIAN_STEP));

            let mut xj_h = *xj;
            xj_h[k] += JACOBIAN_STEP;
            let mut de = self.error(z, xi, &xj_h) - e;
            de.z = normalize_angle(de.z);
            B.set_column(k, &(de / JACOBIAN_STEP));
        }
        (A, B)
    }
}

/// Pose of `xj` expressed in the frame of `xi`.
pub struct RelativePoseModel;

impl MeasurementModel for RelativePoseModel {
    fn prediction(&self, xi: &Vector3<f64>, xj: &Vector3<f64>) -> Vector3<f64> {
        relative_pose(xi, xj)
    }
}

pub fn relative_pose(xi: &Vector3<f64>, xj: &Vector3<f64>) -> Vector3<f64> {
    let local = Rotation2::new(-xi.z) * (xj.xy() - xi.xy());
    Vector3::new(local.x, local.y, normalize_angle(xj.z - xi.z))
}

/// Applies the relative pose `z` to `x`, the inverse of [`relative_pose`].
pub fn compose(x: &Vector3<f64>, z: &Vector3<f64>) -> Vector3<f64> {
    let world: Vector2<f64> = x.xy() + Rotation2::new(x.z) * z.xy();
    Vector3::new(world.x, world.y, normalize_angle(x.z + z.z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn relative_pose_in_rotated_frame() {
        let xi = Vector3::new(1.0, 1.0, FRAC_PI_2);
        let xj = Vector3::new(1.0, 3.0, FRAC_PI_2 + 0.25);
        let z = relative_pose(&xi, &xj);
        approx::assert_abs_diff_eq!(Vector3::new(2.0, 0.0, 0.25), z, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(xj, compose(&xi, &z), epsilon = 1e-12);
    }

    #[test]
    fn error_wraps_rotation() {
        let xi = Vector3::new(0.0, 0.0, 3.0);
        let xj = Vector3::new(0.0, 0.0, -3.0);
        let z = Vector3::new(0.0, 0.0, 0.0);
        let e = RelativePoseModel.error(&z, &xi, &xj);
        let expected = -normalize_angle(-6.0);
        approx::assert_abs_diff_eq!(expected, e.z, epsilon = 1e-12);
        assert!(e.z > -std::f64::consts::PI && e.z <= std::f64::consts::PI);
    }

    #[test]
    fn numerical_jacobian_matches_closed_form() {
        let xi = Vector3::new(0.3, -1.2, 0.4);
        let xj = Vector3::new(2.1, 0.5, 1.1);
        let z = Vector3::new(2.0, 0.9, 0.6);
        let (A, B) = RelativePoseModel.jacobian(&z, &xi, &xj);

        // e = z - R(-ti)(tj - ti), e_theta = z_theta - (tj - ti)
        let (s, c) = xi.z.sin_cos();
        let d = xj.xy() - xi.xy();
        #[rustfmt::skip]
        let A_expected = Matrix3::new(
            c, s, -(-s * d.x + c * d.y),
            -s, c, -(-c * d.x - s * d.y),
            0.0, 0.0, 1.0,
        );
        #[rustfmt::skip]
        let B_expected = Matrix3::new(
            -c, -s, 0.0,
            s, -c, 0.0,
            0.0, 0.0, -1.0,
        );
        approx::assert_abs_diff_eq!(A_expected, A, epsilon = 1e-4);
        approx::assert_abs_diff_eq!(B_expected, B, epsilon = 1e-4);
    }
}
