//! Lap length estimation from loop-closure arc-length separations.
//!
//! Separations of true loop closures are whole multiples of the lap length,
//! so they form clusters. Mixtures with an increasing number of components
//! are fitted until the likelihood gain of one more component drops below
//! [`MIN_LOG_LIKELIHOOD_GAIN`]; the smallest component mean is one lap.

use crate::utils::mixture::{fit_mixture, MixtureFit};

/// Variance added to every mixture component.
pub const MIXTURE_REGULARIZATION: f64 = 1e-3;
/// Smallest log-likelihood improvement that justifies another component.
pub const MIN_LOG_LIKELIHOOD_GAIN: f64 = 2.0;
pub const MAX_COMPONENTS: usize = 8;

#[derive(Debug, Clone)]
pub struct CircumferenceEstimate {
    /// Estimated length of one lap.
    pub circumference: f64,
    /// Number of mixture components kept by the stopping rule.
    pub components: usize,
    pub fit: MixtureFit,
}

/// Fits mixtures with k = 1, 2, ... components and keeps the last one whose
/// likelihood gain over k - 1 reached [`MIN_LOG_LIKELIHOOD_GAIN`].
pub fn select_mixture(samples: &[f64]) -> Option<MixtureFit> {
    let mut best = fit_mixture(samples, 1, MIXTURE_REGULARIZATION)?;
    let max_components = MAX_COMPONENTS.min(samples.len());
    for k in 2..=max_components {
        let Some(fit) = fit_mixture(samples, k, MIXTURE_REGULARIZATION) else {
            break;
        };
        let gain = best.negative_log_likelihood - fit.negative_log_likelihood;
        if gain < MIN_LOG_LIKELIHOOD_GAIN {
            break;
        }
        best = fit;
    }
    Some(best)
}

/// Estimates the lap length from loop-closure arc-length separations.
///
/// Returns `None` when fewer than two separations are available.
pub fn estimate_circumference(arc_lengths: &[f64]) -> Option<CircumferenceEstimate> {
    if arc_lengths.len() < 2 {
        return None;
    }
    let fit = select_mixture(arc_lengths)?;
    Some(CircumferenceEstimate {
        circumference: fit.min_mean(),
        components: fit.components(),
        fit,
    })
}

/// Smallest cluster mean of `samples` with a fixed number of components.
pub fn clustered_min_mean(samples: &[f64], components: usize) -> Option<f64> {
    fit_mixture(samples, components, MIXTURE_REGULARIZATION).map(|fit| fit.min_mean())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_separation_is_insufficient() {
        assert!(estimate_circumference(&[42.0]).is_none());
        assert!(estimate_circumference(&[]).is_none());
    }

    #[test]
    fn lap_multiples_give_the_shortest_lap() {
        let separations = [40.0, 40.1, 39.9, 80.0, 80.1, 79.95, 120.0];
        let estimate = estimate_circumference(&separations).unwrap();
        assert!(estimate.components >= 2);
        approx::assert_abs_diff_eq!(40.0, estimate.circumference, epsilon = 0.05);
    }

    #[test]
    fn one_tight_cluster_keeps_one_component() {
        let separations = [40.0, 40.02, 39.98, 40.01, 39.99];
        let estimate = estimate_circumference(&separations).unwrap();
        approx::assert_abs_diff_eq!(40.0, estimate.circumference, epsilon = 0.02);
    }

    #[test]
    fn fixed_component_rescoring() {
        let samples = [41.0, 41.2, 82.0, 82.4];
        approx::assert_abs_diff_eq!(41.1, clustered_min_mean(&samples, 2).unwrap(), epsilon = 1e-3);
    }
}
