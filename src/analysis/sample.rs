//! Deterministic subsampling of collection ids.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;

/// Pick at most `max_points` ids with a seeded generator.
///
/// `ids` must already be in a stable order (the stores return them sorted).
/// The result keeps that order, so the same ids, seed and limit always give
/// the same sample.
pub fn sample_ids(ids: &[String], max_points: usize, seed: u64) -> Vec<String> {
    if ids.len() <= max_points {
        return ids.to_vec();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = index::sample(&mut rng, ids.len(), max_points).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| ids[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("doc-{i:05}")).collect()
    }

    #[test]
    fn test_small_sets_are_returned_whole() {
        let all = ids(5);
        assert_eq!(sample_ids(&all, 5, 1), all);
        assert_eq!(sample_ids(&all, 10, 1), all);
    }

    #[test]
    fn test_same_seed_same_sample() {
        let all = ids(1000);
        let a = sample_ids(&all, 50, 42);
        let b = sample_ids(&all, 50, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 50);

        let mut sorted = a.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, a);
    }

    #[test]
    fn test_different_seed_different_sample() {
        let all = ids(1000);
        assert_ne!(sample_ids(&all, 50, 1), sample_ids(&all, 50, 2));
    }
}
