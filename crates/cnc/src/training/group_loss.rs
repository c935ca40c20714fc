//! Classification loss collaborator with per-group bookkeeping.
//!
//! The trainer treats the loss as an opaque reducer over
//! `(logits, targets, group_ids)`; between two `log_stats` calls the
//! implementation accumulates per-group loss and accuracy so that worst-group
//! behaviour is visible while training.

use burn::prelude::*;
use burn::tensor::TensorData;

use super::loss::cross_entropy_per_example;
use super::metrics::MetricSink;
use crate::error::{CncError, Result};
use crate::model::bridge::{targets_to_tensor, tensor_to_vec};

/// Reducer from logits to a scalar classification loss.
pub trait GroupLoss<B: Backend> {
    /// Scalar loss of shape `(1,)` for a batch.
    ///
    /// `logits`: `(batch, classes)`; `targets` and `group_ids` have one entry per row.
    fn loss(&mut self, logits: Tensor<B, 2>, targets: &[u32], group_ids: &[i64]) -> Result<Tensor<B, 1>>;

    /// Flush accumulated statistics to `sink` under the `train/` or `valid/` prefix.
    fn log_stats(&mut self, sink: &mut dyn MetricSink, is_training: bool);
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupTally {
    loss_sum: f64,
    correct: usize,
    count: usize,
}

/// Cross-entropy (optionally class-weighted) with per-group statistics.
#[derive(Debug, Clone)]
pub struct GroupStatsLoss {
    class_weights: Option<Vec<f32>>,
    tallies: Vec<GroupTally>,
}

impl GroupStatsLoss {
    pub fn new(n_groups: usize) -> Self {
        Self {
            class_weights: None,
            tallies: vec![GroupTally::default(); n_groups],
        }
    }

    /// Weight each example's loss by the weight of its class.
    pub fn with_class_weights(mut self, weights: Vec<f32>) -> Self {
        self.class_weights = Some(weights);
        self
    }

    pub fn n_groups(&self) -> usize {
        self.tallies.len()
    }

    /// `(avg_loss, accuracy, count)` for group `g` since the last flush.
    pub fn group_stats(&self, g: usize) -> Option<(f64, f64, usize)> {
        let t = self.tallies.get(g)?;
        (t.count > 0).then(|| {
            let n = t.count as f64;
            (t.loss_sum / n, t.correct as f64 / n, t.count)
        })
    }

    fn record<B: Backend>(
        &mut self,
        logits: Tensor<B, 2>,
        per_example: Tensor<B, 1>,
        targets: &[u32],
        group_ids: &[i64],
    ) -> Result<()> {
        let losses = tensor_to_vec(per_example)?;
        let predictions = logits
            .argmax(1)
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| CncError::Shape(format!("{e:?}")))?;

        for i in 0..targets.len() {
            let Some(tally) = usize::try_from(group_ids[i])
                .ok()
                .and_then(|g| self.tallies.get_mut(g))
            else {
                continue;
            };
            tally.loss_sum += losses[i];
            tally.correct += usize::from(predictions[i] == i64::from(targets[i]));
            tally.count += 1;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.tallies.iter_mut().for_each(|t| *t = GroupTally::default());
    }
}

impl<B: Backend> GroupLoss<B> for GroupStatsLoss {
    fn loss(&mut self, logits: Tensor<B, 2>, targets: &[u32], group_ids: &[i64]) -> Result<Tensor<B, 1>> {
        let [batch, classes] = logits.dims();
        if targets.len() != batch || group_ids.len() != batch {
            return Err(CncError::Shape(format!(
                "{batch} logit rows but {} targets and {} group ids",
                targets.len(),
                group_ids.len()
            )));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t as usize >= classes) {
            return Err(CncError::Shape(format!("target {bad} out of range for {classes} classes")));
        }

        let device = logits.device();
        let per_example =
            cross_entropy_per_example(logits.clone(), targets_to_tensor::<B>(targets, &device));
        self.record(logits, per_example.clone(), targets, group_ids)?;

        Ok(match &self.class_weights {
            Some(class_weights) => {
                let weights: Vec<f32> = targets
                    .iter()
                    .map(|&t| class_weights.get(t as usize).copied().unwrap_or(1.0))
                    .collect();
                let weights = Tensor::<B, 1>::from_data(TensorData::new(weights, [batch]), &device);
                (per_example * weights.clone()).sum() / weights.sum()
            }
            None => per_example.mean(),
        })
    }

    fn log_stats(&mut self, sink: &mut dyn MetricSink, is_training: bool) {
        let prefix = if is_training { "train" } else { "valid" };
        let mut worst: Option<f64> = None;
        for g in 0..self.tallies.len() {
            let Some((avg_loss, acc, _)) = self.group_stats(g) else {
                continue;
            };
            sink.log_scalar(&format!("{prefix}/avg_loss_group:{g}"), avg_loss);
            sink.log_scalar(&format!("{prefix}/avg_acc_group:{g}"), acc);
            worst = Some(worst.map_or(acc, |w| w.min(acc)));
        }
        if let Some(robust_acc) = worst {
            sink.log_scalar(&format!("{prefix}/robust_acc"), robust_acc);
        }
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::metrics::MetricsHistory;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn logits(rows: &[[f32; 2]]) -> Tensor<TestBackend, 2> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_data(TensorData::new(flat, [rows.len(), 2]), &Default::default())
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem()
    }

    #[test]
    fn test_unweighted_mean() {
        let mut loss_fn = GroupStatsLoss::new(4);
        let loss = GroupLoss::<TestBackend>::loss(
            &mut loss_fn,
            logits(&[[0.0, 0.0], [0.0, 0.0]]),
            &[0, 1],
            &[0, 3],
        )
        .unwrap();
        assert!((scalar(loss) - 2.0_f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_class_weighted_mean() {
        // per-example losses: ln 2 (target 0) and ~0 (target 1)
        let mut loss_fn = GroupStatsLoss::new(4).with_class_weights(vec![3.0, 1.0]);
        let loss = GroupLoss::<TestBackend>::loss(
            &mut loss_fn,
            logits(&[[0.0, 0.0], [-20.0, 20.0]]),
            &[0, 1],
            &[0, 3],
        )
        .unwrap();
        let expected = 3.0 * 2.0_f32.ln() / 4.0;
        assert!((scalar(loss) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_group_stats_logged_and_reset() {
        let mut loss_fn = GroupStatsLoss::new(4);
        GroupLoss::<TestBackend>::loss(
            &mut loss_fn,
            logits(&[[5.0, 0.0], [0.0, 5.0], [0.0, 5.0], [5.0, 0.0], [0.0, 5.0]]),
            &[0, 0, 1, 1, 1],
            &[0, 0, 3, 1, -1],
        )
        .unwrap();
        assert_eq!(loss_fn.group_stats(0).map(|s| (s.1, s.2)), Some((0.5, 2)));
        assert_eq!(loss_fn.group_stats(1).map(|s| s.1), Some(0.0));
        assert_eq!(loss_fn.group_stats(2), None);

        let mut history = MetricsHistory::new();
        GroupLoss::<TestBackend>::log_stats(&mut loss_fn, &mut history, true);
        assert_eq!(history.last("train/avg_acc_group:3"), Some(1.0));
        assert_eq!(history.last("train/avg_acc_group:0"), Some(0.5));
        assert_eq!(history.last("train/robust_acc"), Some(0.0));
        assert_eq!(history.last("train/avg_acc_group:2"), None);
        assert!(loss_fn.group_stats(0).is_none());

        GroupLoss::<TestBackend>::log_stats(&mut loss_fn, &mut history, false);
        assert_eq!(history.last("valid/robust_acc"), None);
    }

    #[test]
    fn test_shape_errors() {
        let mut loss_fn = GroupStatsLoss::new(4);
        assert!(GroupLoss::<TestBackend>::loss(&mut loss_fn, logits(&[[0.0, 0.0]]), &[0, 1], &[0, 1]).is_err());
        assert!(GroupLoss::<TestBackend>::loss(&mut loss_fn, logits(&[[0.0, 0.0]]), &[2], &[0]).is_err());
    }
}
