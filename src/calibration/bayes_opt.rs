#![allow(non_snake_case)]

//! Sequential model-based minimization of an expensive black-box cost.
//!
//! The cost is modelled by a Gaussian process with a squared exponential
//! kernel over the unit hypercube. After a few random evaluations, every
//! further sample is the random candidate with the largest expected
//! improvement over the best cost seen so far.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::{PI, SQRT_2};

const LENGTH_SCALE: f64 = 0.25;
const OBSERVATION_NOISE: f64 = 1e-6;
const EXPLORATION: f64 = 0.01;
const CANDIDATES: usize = 512;
const INITIAL_SAMPLES: usize = 5;

/// Range of one parameter, optionally searched on a log scale.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBounds {
    pub name: &'static str,
    pub lower: f64,
    pub upper: f64,
    pub log_scale: bool,
}

impl ParameterBounds {
    pub fn linear(name: &'static str, lower: f64, upper: f64) -> ParameterBounds {
        ParameterBounds {
            name,
            lower,
            upper,
            log_scale: false,
        }
    }

    pub fn log(name: &'static str, lower: f64, upper: f64) -> ParameterBounds {
        ParameterBounds {
            name,
            lower,
            upper,
            log_scale: true,
        }
    }

    fn span(&self) -> (f64, f64) {
        if self.log_scale {
            (self.lower.ln(), self.upper.ln())
        } else {
            (self.lower, self.upper)
        }
    }

    /// Position of `x` in `[0, 1]`, clamped to the bounds.
    pub fn to_unit(&self, x: f64) -> f64 {
        let (lo, hi) = self.span();
        let x = x.clamp(self.lower, self.upper);
        let x = if self.log_scale { x.ln() } else { x };
        if hi > lo {
            (x - lo) / (hi - lo)
        } else {
            0.0
        }
    }

    pub fn from_unit(&self, u: f64) -> f64 {
        let (lo, hi) = self.span();
        let x = lo + u.clamp(0.0, 1.0) * (hi - lo);
        let x = if self.log_scale { x.exp() } else { x };
        x.clamp(self.lower, self.upper)
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub parameters: Vec<f64>,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct OptimizationTrace {
    pub best: Evaluation,
    pub evaluations: Vec<Evaluation>,
}

/// Error function, Abramowitz and Stegun 7.1.26 (|error| < 1.5e-7).
pub fn erf(x: f64) -> f64 {
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t * (0.254_829_592 + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * PI).sqrt()
}

fn kernel(a: &[f64], b: &[f64]) -> f64 {
    let d2: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    (-d2 / (2.0 * LENGTH_SCALE * LENGTH_SCALE)).exp()
}

/// Gaussian process posterior over standardized costs.
struct Surrogate {
    points: Vec<Vec<f64>>,
    L: DMatrix<f64>,
    alpha: DVector<f64>,
    best: f64,
}

impl Surrogate {
    fn fit(points: &[Vec<f64>], costs: &[f64]) -> Option<Surrogate> {
        let n = points.len();
        // non-finite costs count as slightly worse than the worst finite one
        let worst = costs.iter().copied().filter(|c| c.is_finite()).fold(f64::NAN, f64::max);
        let worst = if worst.is_nan() { 0.0 } else { worst };
        let y: Vec<f64> = costs
            .iter()
            .map(|&c| if c.is_finite() { c } else { worst + 1.0 })
            .collect();
        let mean = y.iter().sum::<f64>() / n as f64;
        let std = (y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        let std = if std > 1e-12 { std } else { 1.0 };
        let y = DVector::from_iterator(n, y.iter().map(|v| (v - mean) / std));

        let K = DMatrix::from_fn(n, n, |i, j| {
            kernel(&points[i], &points[j]) + if i == j { OBSERVATION_NOISE } else { 0.0 }
        });
        let cholesky = K.cholesky()?;
        let alpha = cholesky.solve(&y);
        Some(Surrogate {
            points: points.to_vec(),
            L: cholesky.l(),
            best: y.min(),
            alpha,
        })
    }

    fn predict(&self, x: &[f64]) -> Option<(f64, f64)> {
        let k = DVector::from_iterator(self.points.len(), self.points.iter().map(|p| kernel(p, x)));
        let mu = k.dot(&self.alpha);
        let v = self.L.solve_lower_triangular(&k)?;
        let variance = (1.0 + OBSERVATION_NOISE - v.dot(&v)).max(1e-12);
        Some((mu, variance.sqrt()))
    }

    fn expected_improvement(&self, x: &[f64]) -> f64 {
        let Some((mu, sigma)) = self.predict(x) else {
            return 0.0;
        };
        let improvement = self.best - mu - EXPLORATION;
        let z = improvement / sigma;
        improvement * normal_cdf(z) + sigma * normal_pdf(z)
    }
}

#[derive(Debug, Clone)]
pub struct BayesianOptimizer {
    pub domain: Vec<ParameterBounds>,
    /// Number of cost evaluations.
    pub budget: usize,
    pub seed: u64,
}

impl BayesianOptimizer {
    pub fn new(domain: Vec<ParameterBounds>, budget: usize, seed: u64) -> BayesianOptimizer {
        BayesianOptimizer {
            domain,
            budget,
            seed,
        }
    }

    fn random_unit(&self, rng: &mut StdRng) -> Vec<f64> {
        (0..self.domain.len()).map(|_| rng.gen::<f64>()).collect()
    }

    fn to_parameters(&self, unit: &[f64]) -> Vec<f64> {
        self.domain.iter().zip(unit).map(|(b, u)| b.from_unit(*u)).collect()
    }

    /// Minimizes `cost` within the domain.
    ///
    /// `start`, when given, is evaluated first. Returns `None` for an empty
    /// domain or a zero budget.
    pub fn minimize<F>(&self, mut cost: F, start: Option<&[f64]>) -> Option<OptimizationTrace>
    where
        F: FnMut(&[f64]) -> f64,
    {
        if self.domain.is_empty() || self.budget == 0 {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut unit_points: Vec<Vec<f64>> = Vec::with_capacity(self.budget);
        let mut evaluations: Vec<Evaluation> = Vec::with_capacity(self.budget);

        for k in 0..self.budget {
            let unit = match (k, start) {
                (0, Some(start)) => self.domain.iter().zip(start).map(|(b, x)| b.to_unit(*x)).collect(),
                _ if k < INITIAL_SAMPLES => self.random_unit(&mut rng),
                _ => {
                    let costs: Vec<f64> = evaluations.iter().map(|e| e.cost).collect();
                    let candidates: Vec<Vec<f64>> = (0..CANDIDATES).map(|_| self.random_unit(&mut rng)).collect();
                    let chosen = match Surrogate::fit(&unit_points, &costs) {
                        Some(surrogate) => candidates
                            .into_iter()
                            .map(|c| (surrogate.expected_improvement(&c), c))
                            .filter(|(ei, _)| ei.is_finite())
                            .max_by(|a, b| a.0.total_cmp(&b.0))
                            .map(|(_, c)| c),
                        None => candidates.into_iter().next(),
                    };
                    chosen.unwrap_or_else(|| self.random_unit(&mut rng))
                }
            };

            let parameters = self.to_parameters(&unit);
            let value = cost(&parameters);
            log::debug!("evaluation {k:3} : cost = {value:.6}, parameters = {parameters:?}");
            unit_points.push(unit);
            evaluations.push(Evaluation { parameters, cost: value });
        }

        let best = evaluations
            .iter()
            .filter(|e| !e.cost.is_nan())
            .min_by(|a, b| a.cost.total_cmp(&b.cost))
            .or(evaluations.first())?
            .clone();
        Some(OptimizationTrace { best, evaluations })
    }
}
