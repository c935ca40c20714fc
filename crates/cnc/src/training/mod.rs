//! Contrastive companion sampling, losses, and the accumulating trainer.
//!
//! A training step resolves a [`ContrastiveTuple`] for every anchor of the
//! mini-batch, backpropagates each anchor's contrastive loss separately, then
//! adds the classification loss over anchors and companions before a single
//! optimizer update.

pub mod group_loss;
pub mod loss;
pub mod metrics;
pub mod sampler;
pub mod step;
pub mod trainer;

pub use group_loss::{GroupLoss, GroupStatsLoss};
pub use loss::{ContrastiveLoss, ContrastiveOutput};
pub use metrics::{EvalMetrics, MetricSink, MetricsHistory, StepMetrics, TracingSink};
pub use sampler::{ContrastiveTuple, PairSampler, SamplingPolicy};
pub use step::{AccumulatingStep, StepOutput};
pub use trainer::{evaluate, fit, resume_from_checkpoint, CheckpointMeta, FitOutput};
