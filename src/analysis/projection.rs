//! Exact t-SNE projection to two or three dimensions.
//!
//! Everything runs sequentially on `f64` with a seeded generator, so the
//! same input and parameters give bit-identical coordinates.

use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Floor for the sample-size-scaled learning rate.
const MIN_LEARNING_RATE: f64 = 1.0;
const EARLY_EXAGGERATION: f64 = 12.0;
const EXAGGERATION_ITERS: usize = 250;
const INITIAL_MOMENTUM: f64 = 0.5;
const FINAL_MOMENTUM: f64 = 0.8;
const MIN_GAIN: f64 = 0.01;
const INIT_SCALE: f64 = 1e-4;
const PERPLEXITY_TOLERANCE: f64 = 1e-5;
const PERPLEXITY_STEPS: usize = 50;
const MIN_PROBABILITY: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct TsneParams {
    pub perplexity: f64,
    pub iterations: usize,
    pub seed: u64,
}

impl Default for TsneParams {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            iterations: 750,
            seed: 42,
        }
    }
}

/// Perplexity usable for `n` points.
pub fn effective_perplexity(perplexity: f64, n: usize) -> f64 {
    let ceiling = ((n.saturating_sub(1)) as f64 / 3.0).max(1.0);
    perplexity.clamp(1.0, ceiling)
}

/// Step size for `n` points: `n / exaggeration / 4`, floored at
/// [`MIN_LEARNING_RATE`]. Small samples diverge under a fixed large rate.
pub fn learning_rate(n: usize) -> f64 {
    (n as f64 / EARLY_EXAGGERATION / 4.0).max(MIN_LEARNING_RATE)
}

/// Project the rows of `data` to `dims` dimensions.
pub fn tsne(data: ArrayView2<f64>, dims: usize, params: &TsneParams) -> Array2<f64> {
    let n = data.nrows();
    if n <= 1 {
        return Array2::zeros((n, dims));
    }

    let distances = squared_distances(data);
    let p = joint_probabilities(&distances, effective_perplexity(params.perplexity, n));

    let eta = learning_rate(n);
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut y = Array2::from_shape_fn((n, dims), |_| gaussian(&mut rng) * INIT_SCALE);
    let mut update = Array2::<f64>::zeros((n, dims));
    let mut gains = Array2::<f64>::ones((n, dims));
    let mut num = Array2::<f64>::zeros((n, n));
    let mut grad = Array2::<f64>::zeros((n, dims));

    for iter in 0..params.iterations {
        let exaggeration = if iter < EXAGGERATION_ITERS {
            EARLY_EXAGGERATION
        } else {
            1.0
        };
        let momentum = if iter < EXAGGERATION_ITERS {
            INITIAL_MOMENTUM
        } else {
            FINAL_MOMENTUM
        };

        // Student-t kernel between embedded points.
        let mut sum_num = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let mut d = 0.0;
                for k in 0..dims {
                    let diff = y[[i, k]] - y[[j, k]];
                    d += diff * diff;
                }
                let q = 1.0 / (1.0 + d);
                num[[i, j]] = q;
                num[[j, i]] = q;
                sum_num += 2.0 * q;
            }
        }

        grad.fill(0.0);
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let q = (num[[i, j]] / sum_num).max(MIN_PROBABILITY);
                let mult = (exaggeration * p[[i, j]] - q) * num[[i, j]];
                for k in 0..dims {
                    grad[[i, k]] += 4.0 * mult * (y[[i, k]] - y[[j, k]]);
                }
            }
        }

        for ((g, u), gain) in grad.iter().zip(update.iter_mut()).zip(gains.iter_mut()) {
            let adjusted = if (*g > 0.0) != (*u > 0.0) {
                *gain + 0.2
            } else {
                *gain * 0.8
            };
            *gain = adjusted.max(MIN_GAIN);
            *u = momentum * *u - eta * *gain * g;
        }
        y += &update;

        if let Some(mean) = y.mean_axis(Axis(0)) {
            y -= &mean;
        }
    }

    y
}

fn squared_distances(data: ArrayView2<f64>) -> Array2<f64> {
    let n = data.nrows();
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d: f64 = data
                .row(i)
                .iter()
                .zip(data.row(j).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            out[[i, j]] = d;
            out[[j, i]] = d;
        }
    }
    out
}

/// Symmetric joint probabilities with per-point bandwidths found by binary
/// search on the entropy.
fn joint_probabilities(distances: &Array2<f64>, perplexity: f64) -> Array2<f64> {
    let n = distances.nrows();
    let target = perplexity.ln();
    let mut conditional = Array2::<f64>::zeros((n, n));
    let mut row = vec![0.0; n];

    for i in 0..n {
        let min_d = (0..n)
            .filter(|&j| j != i)
            .map(|j| distances[[i, j]])
            .fold(f64::INFINITY, f64::min);

        let mut beta = 1.0;
        let mut lo = f64::NEG_INFINITY;
        let mut hi = f64::INFINITY;

        for _ in 0..PERPLEXITY_STEPS {
            let entropy = conditional_row(distances, i, min_d, beta, &mut row);
            let diff = entropy - target;
            if diff.abs() < PERPLEXITY_TOLERANCE {
                break;
            }
            if diff > 0.0 {
                lo = beta;
                beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
            } else {
                hi = beta;
                beta = if lo.is_finite() { (beta + lo) / 2.0 } else { beta / 2.0 };
            }
        }
        conditional_row(distances, i, min_d, beta, &mut row);
        for j in 0..n {
            conditional[[i, j]] = row[j];
        }
    }

    let scale = 2.0 * n as f64;
    let mut joint = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            if i != j {
                joint[[i, j]] =
                    ((conditional[[i, j]] + conditional[[j, i]]) / scale).max(MIN_PROBABILITY);
            }
        }
    }
    joint
}

/// Fill `row` with p(j|i) at bandwidth `beta` and return its entropy.
fn conditional_row(
    distances: &Array2<f64>,
    i: usize,
    min_d: f64,
    beta: f64,
    row: &mut [f64],
) -> f64 {
    let mut sum = 0.0;
    let mut weighted = 0.0;
    for (j, p) in row.iter_mut().enumerate() {
        if j == i {
            *p = 0.0;
            continue;
        }
        let shifted = distances[[i, j]] - min_d;
        *p = (-shifted * beta).exp();
        sum += *p;
        weighted += shifted * *p;
    }
    for p in row.iter_mut() {
        *p /= sum;
    }
    sum.ln() + beta * weighted / sum
}

/// Standard normal sample via Box-Muller.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
