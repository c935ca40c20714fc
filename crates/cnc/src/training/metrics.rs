//! Training and evaluation metrics, health checks, and metric sinks.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Destination for named scalar metrics.
pub trait MetricSink {
    fn log_scalar(&mut self, name: &str, value: f64);

    /// Step the following scalars belong to.
    fn set_step(&mut self, _step: usize) {}
}

impl<S: MetricSink + ?Sized> MetricSink for &mut S {
    fn log_scalar(&mut self, name: &str, value: f64) {
        (**self).log_scalar(name, value);
    }

    fn set_step(&mut self, step: usize) {
        (**self).set_step(step);
    }
}

/// Fan out to two sinks.
impl<A: MetricSink, B: MetricSink> MetricSink for (A, B) {
    fn log_scalar(&mut self, name: &str, value: f64) {
        self.0.log_scalar(name, value);
        self.1.log_scalar(name, value);
    }

    fn set_step(&mut self, step: usize) {
        self.0.set_step(step);
        self.1.set_step(step);
    }
}

/// Emits one `tracing` event per scalar.
#[derive(Debug, Default)]
pub struct TracingSink {
    step: usize,
}

impl MetricSink for TracingSink {
    fn log_scalar(&mut self, name: &str, value: f64) {
        tracing::debug!(step = self.step, metric = name, value, "metric");
    }

    fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: usize,
    pub name: String,
    pub value: f64,
}

/// In-memory metric history, written to `metrics.json` at the end of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsHistory {
    #[serde(skip)]
    step: usize,
    pub records: Vec<MetricRecord>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values of `name` in logging order, paired with their steps.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|r| r.name == name)
            .map(|r| (r.step, r.value))
            .collect()
    }

    /// Most recent value of `name`.
    pub fn last(&self, name: &str) -> Option<f64> {
        self.records.iter().rev().find(|r| r.name == name).map(|r| r.value)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        serde_json::from_reader(file)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))
    }
}

impl MetricSink for MetricsHistory {
    fn log_scalar(&mut self, name: &str, value: f64) {
        self.records.push(MetricRecord {
            step: self.step,
            name: name.to_string(),
            value,
        });
    }

    fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

/// Scalar statistics of one accumulating training step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMetrics {
    /// Blended step loss.
    pub loss: f64,
    /// Classification loss.
    pub train_loss: f64,
    /// Mean per-anchor contrastive loss over the mini-batch.
    pub contrastive_loss: f64,
    /// Mean anchor-positive cosine similarity.
    pub positive_sim: f64,
    /// Mean anchor-negative cosine similarity.
    pub negative_sim: f64,
    pub skipped_anchors: f64,
    pub anchors: f64,
}

impl StepMetrics {
    /// Warnings for values that indicate a broken run.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.loss.is_finite() {
            warnings.push(format!("loss is not finite ({})", self.loss));
        }
        if self.anchors > 0.0 && self.skipped_anchors >= self.anchors {
            warnings.push("every anchor was skipped; no contrastive signal".to_string());
        }
        let contributing = self.anchors - self.skipped_anchors;
        if contributing > 0.0 && self.positive_sim <= self.negative_sim {
            warnings.push(format!(
                "positive similarity {:.3} not above negative similarity {:.3}",
                self.positive_sim, self.negative_sim
            ));
        }
        warnings
    }

    /// Emit every field under its metric name.
    pub fn log(&self, sink: &mut dyn MetricSink) {
        sink.log_scalar("loss", self.loss);
        sink.log_scalar("train_loss", self.train_loss);
        sink.log_scalar("contrastive_loss", self.contrastive_loss);
        sink.log_scalar("positive_sim", self.positive_sim);
        sink.log_scalar("negative_sim", self.negative_sim);
        sink.log_scalar("skipped_anchors", self.skipped_anchors);
    }
}

/// Running average of [`StepMetrics`] over a logging interval.
#[derive(Debug, Default)]
pub struct RunningAvg {
    sum: StepMetrics,
    count: usize,
}

impl RunningAvg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn update(&mut self, m: &StepMetrics) {
        self.sum.loss += m.loss;
        self.sum.train_loss += m.train_loss;
        self.sum.contrastive_loss += m.contrastive_loss;
        self.sum.positive_sim += m.positive_sim;
        self.sum.negative_sim += m.negative_sim;
        self.sum.skipped_anchors += m.skipped_anchors;
        self.sum.anchors += m.anchors;
        self.count += 1;
    }

    pub fn avg_metrics(&self) -> Option<StepMetrics> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(StepMetrics {
            loss: self.sum.loss / n,
            train_loss: self.sum.train_loss / n,
            contrastive_loss: self.sum.contrastive_loss / n,
            positive_sim: self.sum.positive_sim / n,
            negative_sim: self.sum.negative_sim / n,
            skipped_anchors: self.sum.skipped_anchors / n,
            anchors: self.sum.anchors / n,
        })
    }

    pub fn display(&self) -> String {
        match self.avg_metrics() {
            None => "no data".to_string(),
            Some(m) => format!(
                "loss={:.4} cls={:.4} con={:.4} pos_sim={:.3} neg_sim={:.3} skipped={:.1}",
                m.loss, m.train_loss, m.contrastive_loss, m.positive_sim, m.negative_sim,
                m.skipped_anchors,
            ),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Validation metrics over a full split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    /// Binary AUROC of the class-1 probability; `None` for multiclass or single-class splits.
    pub auroc: Option<f64>,
    /// Accuracy per group id present in the split.
    pub group_accuracy: BTreeMap<usize, f64>,
    /// Lowest group accuracy over the groups present.
    pub worst_group_accuracy: Option<f64>,
    pub examples: usize,
}

impl EvalMetrics {
    /// Aggregate per-example predictions.
    ///
    /// `probs[i]` are class probabilities, `losses[i]` the cross-entropy of
    /// example `i`. Negative group ids are left out of group accuracy.
    pub fn compute(probs: &[Vec<f64>], targets: &[u32], group_ids: &[i64], losses: &[f64]) -> Self {
        let n = probs.len();
        let correct: Vec<bool> = probs
            .iter()
            .zip(targets)
            .map(|(p, &t)| argmax(p) == t as usize)
            .collect();

        let mut per_group: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for (&g, &ok) in group_ids.iter().zip(&correct) {
            if let Ok(g) = usize::try_from(g) {
                let entry = per_group.entry(g).or_default();
                entry.0 += usize::from(ok);
                entry.1 += 1;
            }
        }
        let group_accuracy: BTreeMap<usize, f64> = per_group
            .into_iter()
            .map(|(g, (ok, total))| (g, ok as f64 / total as f64))
            .collect();
        let worst_group_accuracy = group_accuracy.values().copied().reduce(f64::min);

        let auroc = if probs.first().is_some_and(|p| p.len() == 2) {
            let scores: Vec<f64> = probs.iter().map(|p| p[1]).collect();
            binary_auroc(&scores, targets)
        } else {
            None
        };

        let denom = n.max(1) as f64;
        Self {
            loss: losses.iter().sum::<f64>() / denom,
            accuracy: correct.iter().filter(|&&c| c).count() as f64 / denom,
            auroc,
            group_accuracy,
            worst_group_accuracy,
            examples: n,
        }
    }

    /// Emit `{prefix}_loss`, `{prefix}_accuracy`, `{prefix}_auroc` and the
    /// per-group `{prefix}/...` scalars.
    pub fn log(&self, prefix: &str, sink: &mut dyn MetricSink) {
        sink.log_scalar(&format!("{prefix}_loss"), self.loss);
        sink.log_scalar(&format!("{prefix}_accuracy"), self.accuracy);
        if let Some(auroc) = self.auroc {
            sink.log_scalar(&format!("{prefix}_auroc"), auroc);
        }
        for (g, acc) in &self.group_accuracy {
            sink.log_scalar(&format!("{prefix}/acc_group:{g}"), *acc);
        }
        if let Some(worst) = self.worst_group_accuracy {
            sink.log_scalar(&format!("{prefix}/worst_group_acc"), worst);
        }
    }
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// Area under the ROC curve for scores against binary labels.
///
/// Mann-Whitney formulation with tied scores sharing their average rank.
/// `None` when either class is absent.
pub fn binary_auroc(scores: &[f64], labels: &[u32]) -> Option<f64> {
    let n_pos = labels.iter().filter(|&&l| l == 1).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1..=j+1 share their mean.
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            ranks[k] = rank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = ranks
        .iter()
        .zip(labels)
        .filter(|(_, &l)| l == 1)
        .map(|(r, _)| r)
        .sum();
    let n_pos = n_pos as f64;
    Some((pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64))
}
