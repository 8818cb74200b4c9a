pub mod mixture;

use std::f64::consts::{PI, TAU};

pub fn deg2rad(x: f64) -> f64 {
    const DEG2RAD_FACTOR: f64 = std::f64::consts::PI / 180.0;
    x * DEG2RAD_FACTOR
}

pub fn rad2deg(x: f64) -> f64 {
    const RAD2DEG_FACTOR: f64 = 180.0 / std::f64::consts::PI;
    x * RAD2DEG_FACTOR
}

/// Wraps an angle to (-pi, pi]. Both -pi and pi map to pi.
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

/// Piecewise linear interpolation of `ys` sampled at the non-decreasing
/// abscissae `xs`, clamped to the end values outside the sampled range.
///
/// Repeated abscissae encode a step: the query takes the value to the right
/// of the step, so a profile of `(s0, h0), (s1, h0), (s1, h1), (s2, h1)`
/// evaluates to `h1` at exactly `s1`.
pub fn interp1(xs: &[f64], ys: &[f64], query: f64) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    let Some(&last) = ys.last() else {
        return f64::NAN;
    };
    let k = xs.partition_point(|&x| x <= query);
    if k == 0 {
        return ys[0];
    }
    if k == xs.len() {
        return last;
    }
    let (x0, x1) = (xs[k - 1], xs[k]);
    let t = (query - x0) / (x1 - x0);
    ys[k - 1] + t * (ys[k] - ys[k - 1])
}

/// `n` evenly spaced values over the closed interval [start, end].
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![0.5 * (start + end)],
        _ => {
            let span = end - start;
            let last = (n - 1) as f64;
            (0..n)
                .map(|i| start + span * (i as f64 / last))
                .collect()
        }
    }
}
