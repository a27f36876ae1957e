//! Outlier flagging by distance to the assigned centroid.

use ndarray::ArrayView2;

use super::cluster::{KMeans, squared_distance};

/// Flag rows whose distance to their own centroid lies more than `threshold`
/// standard deviations above the mean centroid distance of all rows.
pub fn flag_outliers(data: ArrayView2<f64>, clustering: &KMeans, threshold: f64) -> Vec<bool> {
    let distances: Vec<f64> = data
        .rows()
        .into_iter()
        .zip(&clustering.labels)
        .map(|(row, &label)| squared_distance(row, clustering.centroids.row(label)).sqrt())
        .collect();

    let n = distances.len();
    if n < 2 {
        return vec![false; n];
    }

    let mean = distances.iter().sum::<f64>() / n as f64;
    let variance = distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n as f64;
    let std = variance.sqrt();
    if std <= f64::EPSILON {
        return vec![false; n];
    }

    distances
        .iter()
        .map(|d| (d - mean) / std > threshold)
        .collect()
}
