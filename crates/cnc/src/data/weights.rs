//! Per-example draw weights and mini-batch construction.
//!
//! Weights are computed once per run from the group counts of the training
//! pool and never mutated mid-epoch.

use std::collections::HashMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{CncError, Result};

/// Inverse group-frequency weights, `(1 + (N - count(g)) / N) ^ alpha`.
///
/// Examples with a negative (unlabelled) group id keep weight 1.
pub fn robust_sampler_weights(group_ids: &[i64], alpha: f64) -> Vec<f64> {
    let n = group_ids.len() as f64;
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for &g in group_ids {
        *counts.entry(g).or_default() += 1;
    }
    group_ids
        .iter()
        .map(|g| {
            if *g < 0 {
                return 1.0;
            }
            let count = counts[g] as f64;
            (1.0 + (n - count) / n).powf(alpha)
        })
        .collect()
}

/// Class-balancing weights: target-1 examples get `#target0 / #target1`.
pub fn class_balance_weights(targets: &[u32]) -> Vec<f64> {
    let positives = targets.iter().filter(|&&t| t == 1).count();
    let negatives = targets.len() - positives;
    let ratio = if positives > 0 {
        negatives as f64 / positives as f64
    } else {
        1.0
    };
    targets
        .iter()
        .map(|&t| if t == 1 { ratio } else { 1.0 })
        .collect()
}

/// Cross-entropy class weights, `(1 + (1 - frac_c)) ^ alpha`.
///
/// Weights stay fractional on purpose rather than being truncated to
/// integers, which would map nearly every class to 1 when `alpha <= 1`.
pub fn class_loss_weights(targets: &[u32], num_classes: usize, alpha: f64) -> Vec<f32> {
    let n = targets.len().max(1) as f64;
    (0..num_classes)
        .map(|c| {
            let frac = targets.iter().filter(|&&t| t as usize == c).count() as f64 / n;
            (1.0 + (1.0 - frac)).powf(alpha) as f32
        })
        .collect()
}

/// How positions are drawn for an epoch.
#[derive(Debug, Clone)]
enum DrawMode {
    /// Shuffle the pool, no replacement.
    Shuffle,
    /// Uniform draws with replacement.
    Uniform { num_samples: usize },
    /// Weighted draws with replacement.
    Weighted {
        index: WeightedIndex<f64>,
        num_samples: usize,
    },
}

/// Builds mini-batches of dataset positions for each epoch.
///
/// Incomplete trailing batches are dropped.
#[derive(Debug, Clone)]
pub struct BatchSampler {
    pool: Vec<usize>,
    batch_size: usize,
    mode: DrawMode,
}

impl BatchSampler {
    /// Shuffle `pool` every epoch.
    pub fn shuffled(pool: Vec<usize>, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size,
            mode: DrawMode::Shuffle,
        }
    }

    /// Draw `num_samples` positions uniformly with replacement.
    pub fn uniform(pool: Vec<usize>, batch_size: usize, num_samples: usize) -> Self {
        Self {
            pool,
            batch_size,
            mode: DrawMode::Uniform { num_samples },
        }
    }

    /// Draw `num_samples` positions with replacement, proportional to `weights`.
    ///
    /// `weights[i]` belongs to `pool[i]`.
    pub fn weighted(
        pool: Vec<usize>,
        weights: &[f64],
        batch_size: usize,
        num_samples: usize,
    ) -> Result<Self> {
        if weights.len() != pool.len() {
            return Err(CncError::Shape(format!(
                "{} weights for a pool of {}",
                weights.len(),
                pool.len()
            )));
        }
        let index = WeightedIndex::new(weights)
            .map_err(|e| CncError::Config(format!("invalid sampler weights: {e}")))?;
        Ok(Self {
            pool,
            batch_size,
            mode: DrawMode::Weighted { index, num_samples },
        })
    }

    pub fn pool(&self) -> &[usize] {
        &self.pool
    }

    /// Number of full batches per epoch.
    pub fn batches_per_epoch(&self) -> usize {
        let drawn = match &self.mode {
            DrawMode::Shuffle => self.pool.len(),
            DrawMode::Uniform { num_samples } | DrawMode::Weighted { num_samples, .. } => {
                *num_samples
            }
        };
        drawn / self.batch_size.max(1)
    }

    /// Draw one epoch's worth of mini-batches.
    pub fn epoch_batches(&self, rng: &mut impl Rng) -> Vec<Vec<usize>> {
        if self.pool.is_empty() || self.batch_size == 0 {
            return Vec::new();
        }
        let order: Vec<usize> = match &self.mode {
            DrawMode::Shuffle => {
                let mut order = self.pool.clone();
                order.shuffle(rng);
                order
            }
            DrawMode::Uniform { num_samples } => (0..*num_samples)
                .map(|_| self.pool[rng.gen_range(0..self.pool.len())])
                .collect(),
            DrawMode::Weighted { index, num_samples } => (0..*num_samples)
                .map(|_| self.pool[index.sample(rng)])
                .collect(),
        };
        order
            .chunks_exact(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_robust_weights_exact_values() {
        let mut groups = vec![0_i64; 90];
        groups.extend(std::iter::repeat(1).take(10));
        let weights = robust_sampler_weights(&groups, 1.0);
        assert!((weights[0] - 1.1).abs() < 1e-12, "majority weight {}", weights[0]);
        assert!((weights[99] - 1.9).abs() < 1e-12, "minority weight {}", weights[99]);
    }

    #[test]
    fn test_robust_weights_alpha_exponent() {
        let mut groups = vec![0_i64; 90];
        groups.extend(std::iter::repeat(1).take(10));
        let weights = robust_sampler_weights(&groups, 2.0);
        assert!((weights[0] - 1.21).abs() < 1e-12);
        assert!((weights[99] - 3.61).abs() < 1e-12);
    }

    #[test]
    fn test_robust_weights_unlabeled_keep_one() {
        let weights = robust_sampler_weights(&[0, 0, -1, 1], 1.0);
        assert_eq!(weights[2], 1.0);
        assert!((weights[0] - 1.5).abs() < 1e-12);
        assert!((weights[3] - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_class_balance_weights() {
        let weights = class_balance_weights(&[0, 0, 0, 1]);
        assert_eq!(weights, vec![1.0, 1.0, 1.0, 3.0]);
        assert_eq!(class_balance_weights(&[0, 0]), vec![1.0, 1.0]);
    }

    #[test]
    fn test_class_loss_weights() {
        let weights = class_loss_weights(&[0, 0, 0, 1], 2, 1.0);
        assert!((weights[0] - 1.25).abs() < 1e-6);
        assert!((weights[1] - 1.75).abs() < 1e-6);
    }

    #[test]
    fn test_shuffle_drops_last_and_covers_pool() {
        let sampler = BatchSampler::shuffled((0..10).collect(), 3);
        let mut rng = StdRng::seed_from_u64(7);
        let batches = sampler.epoch_batches(&mut rng);
        assert_eq!(batches.len(), 3);
        assert_eq!(sampler.batches_per_epoch(), 3);
        let mut seen: Vec<usize> = batches.concat();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 9, "no duplicates without replacement");
    }

    #[test]
    fn test_weighted_draws_favor_heavy_examples() {
        let pool: Vec<usize> = (100..110).collect();
        let mut weights = vec![1.0; 10];
        weights[0] = 50.0;
        let sampler = BatchSampler::weighted(pool, &weights, 10, 1000).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let draws = sampler.epoch_batches(&mut rng).concat();
        assert_eq!(draws.len(), 1000);
        let heavy = draws.iter().filter(|&&i| i == 100).count();
        assert!(heavy > 700, "expected heavy example to dominate, got {heavy}");
        assert!(draws.iter().all(|i| (100..110).contains(i)));
    }

    #[test]
    fn test_weighted_rejects_mismatched_lengths() {
        assert!(BatchSampler::weighted(vec![0, 1], &[1.0], 1, 4).is_err());
        assert!(BatchSampler::weighted(vec![0, 1], &[0.0, 0.0], 1, 4).is_err());
    }

    #[test]
    fn test_uniform_with_replacement() {
        let sampler = BatchSampler::uniform(vec![5, 6], 4, 8);
        let mut rng = StdRng::seed_from_u64(3);
        let batches = sampler.epoch_batches(&mut rng);
        assert_eq!(batches.len(), 2);
        assert!(batches.concat().iter().all(|i| *i == 5 || *i == 6));
    }
}
