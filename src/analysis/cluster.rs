//! Seeded k-means (k-means++ initialization, Lloyd iterations).

use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_ITERATIONS: usize = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeans {
    /// Cluster index per input row.
    pub labels: Vec<usize>,
    pub centroids: Array2<f64>,
    pub iterations: usize,
}

impl KMeans {
    pub fn k(&self) -> usize {
        self.centroids.nrows()
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.k()];
        for &label in &self.labels {
            sizes[label] += 1;
        }
        sizes
    }
}

/// Cluster the rows of `data` into at most `k` groups.
///
/// `k` is clamped to the number of rows. Ties go to the lowest centroid index.
pub fn kmeans(data: ArrayView2<f64>, k: usize, seed: u64) -> KMeans {
    let n = data.nrows();
    let k = k.min(n);
    if k == 0 {
        return KMeans {
            labels: Vec::new(),
            centroids: Array2::zeros((0, data.ncols())),
            iterations: 0,
        };
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = init_plus_plus(data, k, &mut rng);
    let mut labels = vec![usize::MAX; n];
    let mut iterations = 0;

    while iterations < MAX_ITERATIONS {
        iterations += 1;

        let mut changed = false;
        for (i, row) in data.rows().into_iter().enumerate() {
            let nearest = nearest_centroid(row, centroids.view());
            if labels[i] != nearest {
                labels[i] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = Array2::<f64>::zeros(centroids.dim());
        let mut counts = vec![0usize; k];
        for (row, &label) in data.rows().into_iter().zip(&labels) {
            let mut sum = sums.row_mut(label);
            sum += &row;
            counts[label] += 1;
        }
        for (c, count) in counts.iter().enumerate() {
            // Empty clusters keep their previous centroid.
            if *count > 0 {
                let mean = &sums.row(c) / *count as f64;
                centroids.row_mut(c).assign(&mean);
            }
        }
    }

    KMeans {
        labels,
        centroids,
        iterations,
    }
}

fn init_plus_plus(data: ArrayView2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let n = data.nrows();
    let mut centroids = Array2::zeros((k, data.ncols()));
    let mut chosen = Vec::with_capacity(k);

    let first = rng.random_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));
    chosen.push(first);

    let mut closest: Vec<f64> = data
        .rows()
        .into_iter()
        .map(|row| squared_distance(row, data.row(first)))
        .collect();

    for c in 1..k {
        let total: f64 = closest.iter().sum();
        let next = if total > 0.0 {
            let target = rng.random::<f64>() * total;
            let mut cumulative = 0.0;
            let mut pick = n - 1;
            for (i, weight) in closest.iter().enumerate() {
                cumulative += weight;
                if *weight > 0.0 && cumulative >= target {
                    pick = i;
                    break;
                }
            }
            pick
        } else {
            // All remaining points coincide with a centroid.
            let unused: Vec<usize> = (0..n).filter(|i| !chosen.contains(i)).collect();
            unused[rng.random_range(0..unused.len())]
        };

        centroids.row_mut(c).assign(&data.row(next));
        chosen.push(next);
        for (i, row) in data.rows().into_iter().enumerate() {
            closest[i] = closest[i].min(squared_distance(row, data.row(next)));
        }
    }

    centroids
}

fn nearest_centroid(row: ArrayView1<f64>, centroids: ArrayView2<f64>) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d = squared_distance(row, centroid);
        if d < best_distance {
            best_distance = d;
            best = c;
        }
    }
    best
}

pub(crate) fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
