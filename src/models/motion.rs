use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::MappingError;

/// Smallest variance a noise model may report.
pub const MIN_VARIANCE: f64 = 1e-6;
/// Smallest diagonal precision handed to the solver.
pub const MIN_INFORMATION: f64 = 1e-6;

/// Noise model of a relative-pose odometry measurement `z = [dx, dy, dtheta]`.
///
/// Implementors return the diagonal covariance, the information matrix is
/// derived from it with the flooring applied.
pub trait OdometryNoiseModel {
    fn covariance(&self, z: &Vector3<f64>) -> Matrix3<f64>;

    fn information(&self, z: &Vector3<f64>) -> Matrix3<f64> {
        let cov = self.covariance(z);
        Matrix3::from_diagonal(&Vector3::from_fn(|i, _| {
            (1.0 / cov[(i, i)].max(MIN_VARIANCE)).max(MIN_INFORMATION)
        }))
    }
}

/// Variance grows with the magnitude of each measured axis.
///
/// var_x = a3 dx^2 + a4 dtheta^2
///
/// var_y = a3 dy^2 + a4 dtheta^2
///
/// var_theta = a1 dtheta^2 + a2 (dx^2 + dy^2)
pub struct PerAxisNoise {
    a1: f64,
    a2: f64,
    a3: f64,
    a4: f64,
}

impl PerAxisNoise {
    pub fn new(a1: f64, a2: f64, a3: f64, a4: f64) -> PerAxisNoise {
        PerAxisNoise { a1, a2, a3, a4 }
    }
}

impl OdometryNoiseModel for PerAxisNoise {
    fn covariance(&self, z: &Vector3<f64>) -> Matrix3<f64> {
        let dx2 = z.x.powi(2);
        let dy2 = z.y.powi(2);
        let dt2 = z.z.powi(2);
        Matrix3::from_diagonal(&Vector3::new(
            self.a3 * dx2 + self.a4 * dt2,
            self.a3 * dy2 + self.a4 * dt2,
            self.a1 * dt2 + self.a2 * (dx2 + dy2),
        ))
    }
}

/// Odometry decomposed as rotation, translation, rotation
/// (Probabilistic Robotics p. 136), with the control-space variances
/// projected onto the heading of the translation.
pub struct TrigonometricNoise {
    a1: f64,
    a2: f64,
    a3: f64,
    a4: f64,
}

impl TrigonometricNoise {
    pub fn new(a1: f64, a2: f64, a3: f64, a4: f64) -> TrigonometricNoise {
        TrigonometricNoise { a1, a2, a3, a4 }
    }
}

impl OdometryNoiseModel for TrigonometricNoise {
    fn covariance(&self, z: &Vector3<f64>) -> Matrix3<f64> {
        let trans = z.xy().norm();
        let rot1 = if trans > 0.0 { f64::atan2(z.y, z.x) } else { 0.0 };
        let rot2 = z.z - rot1;

        let trans2 = trans.powi(2);
        let var_rot1 = self.a1 * rot1.powi(2) + self.a2 * trans2;
        let var_rot2 = self.a1 * rot2.powi(2) + self.a2 * trans2;
        let var_trans = self.a3 * trans2 + self.a4 * (rot1.powi(2) + rot2.powi(2));

        let (s, c) = rot1.sin_cos();
        Matrix3::from_diagonal(&Vector3::new(
            c * c * var_trans + trans2 * s * s * var_rot1,
            s * s * var_trans + trans2 * c * c * var_rot1,
            var_rot1 + var_rot2,
        ))
    }
}

/// Selects one of the odometry noise parameterisations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoiseModelKind {
    #[default]
    PerAxis,
    Trigonometric,
}

impl NoiseModelKind {
    pub fn model(&self, alpha: [f64; 4]) -> Box<dyn OdometryNoiseModel + Send + Sync> {
        let [a1, a2, a3, a4] = alpha;
        match self {
            NoiseModelKind::PerAxis => Box::new(PerAxisNoise::new(a1, a2, a3, a4)),
            NoiseModelKind::Trigonometric => Box::new(TrigonometricNoise::new(a1, a2, a3, a4)),
        }
    }
}

impl FromStr for NoiseModelKind {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-axis" => Ok(NoiseModelKind::PerAxis),
            "trigonometric" => Ok(NoiseModelKind::Trigonometric),
            _ => Err(MappingError::InvalidMode {
                kind: "noise model",
                value: s.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurements() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(2.5, 0.3, 0.4),
            Vector3::new(0.7, -0.2, -1.2),
            Vector3::new(4.0, 1.0, std::f64::consts::PI),
        ]
    }

    fn assert_precision_drops(kind: NoiseModelKind) {
        let low = kind.model([0.01, 0.01, 0.01, 0.01]);
        let high = kind.model([0.05, 0.05, 0.05, 0.05]);
        for z in measurements() {
            let info_low = low.information(&z);
            let info_high = high.information(&z);
            let dropped = (0..3).any(|i| info_high[(i, i)] < info_low[(i, i)]);
            assert!(dropped, "{kind:?} {z:?}: {info_low} vs {info_high}");
            assert!((0..3).all(|i| info_high[(i, i)] <= info_low[(i, i)]));
        }
    }

    #[test]
    fn per_axis_precision_decreases_with_noise() {
        assert_precision_drops(NoiseModelKind::PerAxis);
    }

    #[test]
    fn trigonometric_precision_decreases_with_noise() {
        assert_precision_drops(NoiseModelKind::Trigonometric);
    }

    #[test]
    fn information_is_floored() {
        let model = PerAxisNoise::new(0.0, 0.0, 0.0, 0.0);
        let info = model.information(&Vector3::new(1.0, 0.0, 0.0));
        for i in 0..3 {
            approx::assert_abs_diff_eq!(1.0 / MIN_VARIANCE, info[(i, i)]);
        }

        let huge = PerAxisNoise::new(1e12, 1e12, 1e12, 1e12);
        let info = huge.information(&Vector3::new(1.0, 1.0, 1.0));
        for i in 0..3 {
            approx::assert_abs_diff_eq!(MIN_INFORMATION, info[(i, i)]);
        }
    }

    #[test]
    fn noise_model_selector_parses() {
        assert_eq!(
            NoiseModelKind::Trigonometric,
            "trigonometric".parse::<NoiseModelKind>().unwrap()
        );
        assert!(matches!(
            "gaussian".parse::<NoiseModelKind>(),
            Err(MappingError::InvalidMode { .. })
        ));
    }
}
