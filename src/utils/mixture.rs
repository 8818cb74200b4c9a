//! One-dimensional Gaussian mixture clustering fitted by expectation maximization.

use std::f64::consts::TAU;

const MAX_EM_ITERATIONS: usize = 200;
const EM_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
struct UnivariateNormal {
    mean: f64,
    variance: f64,
}

impl UnivariateNormal {
    fn ln_pdf(&self, x: f64) -> f64 {
        let dx = x - self.mean;
        -0.5 * ((TAU * self.variance).ln() + dx * dx / self.variance)
    }
}

/// Result of a mixture fit. Components are sorted by ascending mean.
#[derive(Debug, Clone)]
pub struct MixtureFit {
    pub means: Vec<f64>,
    pub variances: Vec<f64>,
    pub weights: Vec<f64>,
    /// Total negative log-likelihood of the samples under the fitted mixture.
    pub negative_log_likelihood: f64,
}

impl MixtureFit {
    pub fn components(&self) -> usize {
        self.means.len()
    }

    pub fn min_mean(&self) -> f64 {
        self.means.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Fits a `components`-component mixture to `samples`.
///
/// `regularization` is added to every component variance so that components
/// collapsing onto a single value keep a finite likelihood. The component
/// count is capped by the number of samples. Returns `None` for an empty or
/// non-finite sample set.
pub fn fit_mixture(samples: &[f64], components: usize, regularization: f64) -> Option<MixtureFit> {
    if samples.is_empty() || samples.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let n = samples.len();
    let k = components.clamp(1, n);
    let regularization = regularization.max(f64::MIN_POSITIVE);

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mean_all = sorted.iter().sum::<f64>() / n as f64;
    let var_all = sorted.iter().map(|x| (x - mean_all).powi(2)).sum::<f64>() / n as f64;

    // quantile initialisation keeps the fit deterministic
    let mut gaussians: Vec<UnivariateNormal> = (0..k)
        .map(|c| {
            let idx = (((c as f64 + 0.5) / k as f64) * n as f64) as usize;
            UnivariateNormal {
                mean: sorted[idx.min(n - 1)],
                variance: var_all / k as f64 + regularization,
            }
        })
        .collect();
    let mut weights = vec![1.0 / k as f64; k];

    let mut responsibilities = vec![vec![0.0; k]; n];
    let mut log_likelihood = f64::NEG_INFINITY;
    let mut joint = vec![0.0; k];

    for _ in 0..MAX_EM_ITERATIONS {
        // E-step
        let mut ll = 0.0;
        for (x, resp) in samples.iter().zip(responsibilities.iter_mut()) {
            for c in 0..k {
                joint[c] = weights[c].ln() + gaussians[c].ln_pdf(*x);
            }
            let norm = log_sum_exp(&joint);
            ll += norm;
            for c in 0..k {
                resp[c] = (joint[c] - norm).exp();
            }
        }

        // M-step
        for c in 0..k {
            let nk: f64 = responsibilities.iter().map(|r| r[c]).sum();
            if nk <= f64::EPSILON {
                weights[c] = f64::EPSILON;
                continue;
            }
            let mean = samples
                .iter()
                .zip(responsibilities.iter())
                .map(|(x, r)| r[c] * x)
                .sum::<f64>()
                / nk;
            let variance = samples
                .iter()
                .zip(responsibilities.iter())
                .map(|(x, r)| r[c] * (x - mean).powi(2))
                .sum::<f64>()
                / nk;
            gaussians[c] = UnivariateNormal {
                mean,
                variance: variance + regularization,
            };
            weights[c] = nk / n as f64;
        }
        let total: f64 = weights.iter().sum();
        weights.iter_mut().for_each(|w| *w /= total);

        let converged = (ll - log_likelihood).abs() <= EM_TOLERANCE * (1.0 + ll.abs());
        log_likelihood = ll;
        if converged {
            break;
        }
    }

    // likelihood of the final parameters
    let total_ll: f64 = samples
        .iter()
        .map(|x| {
            for c in 0..k {
                joint[c] = weights[c].ln() + gaussians[c].ln_pdf(*x);
            }
            log_sum_exp(&joint)
        })
        .sum();

    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| gaussians[a].mean.total_cmp(&gaussians[b].mean));

    Some(MixtureFit {
        means: order.iter().map(|&c| gaussians[c].mean).collect(),
        variances: order.iter().map(|&c| gaussians[c].variance).collect(),
        weights: order.iter().map(|&c| weights[c]).collect(),
        negative_log_likelihood: -total_ll,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_component_matches_sample_moments() {
        let samples = [1.0, 2.0, 3.0, 4.0];
        let fit = fit_mixture(&samples, 1, 0.0).unwrap();
        approx::assert_abs_diff_eq!(2.5, fit.means[0], epsilon = 1e-12);
        approx::assert_abs_diff_eq!(1.25, fit.variances[0], epsilon = 1e-9);
        approx::assert_abs_diff_eq!(1.0, fit.weights[0], epsilon = 1e-12);
    }

    #[test]
    fn two_separated_clusters_are_recovered() {
        let samples = [39.8, 40.1, 40.0, 40.2, 79.9, 80.2, 80.0];
        let fit = fit_mixture(&samples, 2, 1e-3).unwrap();
        assert_eq!(2, fit.components());
        approx::assert_abs_diff_eq!(40.025, fit.means[0], epsilon = 1e-3);
        approx::assert_abs_diff_eq!(80.033, fit.means[1], epsilon = 1e-3);
        approx::assert_abs_diff_eq!(40.025, fit.min_mean(), epsilon = 1e-3);

        let one = fit_mixture(&samples, 1, 1e-3).unwrap();
        assert!(fit.negative_log_likelihood < one.negative_log_likelihood);
    }

    #[test]
    fn regularization_keeps_degenerate_fit_finite() {
        let samples = [10.0, 10.0, 10.0];
        let fit = fit_mixture(&samples, 1, 1e-3).unwrap();
        assert!(fit.negative_log_likelihood.is_finite());
        approx::assert_abs_diff_eq!(1e-3, fit.variances[0], epsilon = 1e-12);
    }

    #[test]
    fn weights_sum_to_one_and_match_reported_likelihood() {
        // two components start on the same sample
        let samples = [0.0, 0.0, 0.1, 0.0, -0.1, 1000.0];
        let fit = fit_mixture(&samples, 3, 1e-6).unwrap();
        approx::assert_abs_diff_eq!(1.0, fit.weights.iter().sum::<f64>(), epsilon = 1e-12);

        let nll: f64 = samples
            .iter()
            .map(|x| {
                let joint: Vec<f64> = (0..fit.components())
                    .map(|c| {
                        let normal = UnivariateNormal {
                            mean: fit.means[c],
                            variance: fit.variances[c],
                        };
                        fit.weights[c].ln() + normal.ln_pdf(*x)
                    })
                    .collect();
                -log_sum_exp(&joint)
            })
            .sum();
        approx::assert_abs_diff_eq!(nll, fit.negative_log_likelihood, epsilon = 1e-9);
    }

    #[test]
    fn empty_samples_have_no_fit() {
        assert!(fit_mixture(&[], 2, 1e-3).is_none());
        assert!(fit_mixture(&[1.0, f64::NAN], 1, 1e-3).is_none());
    }
}
