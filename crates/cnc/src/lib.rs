//! Correct-N-Contrast (CnC) for spurious-correlation robustness.
//!
//! Builds group-conditioned contrastive tuples (an anchor, same-label
//! positives and different-label negatives chosen to contradict a spurious
//! attribute), computes the supervised contrastive loss on encoder
//! embeddings, and blends it with classification loss in a
//! gradient-accumulating training step.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod scoring;
pub mod training;

pub use config::{Method, RunConfig};
pub use data::{Dataset, Example, Split};
pub use error::{CncError, Result};
pub use model::{Backbone, BackboneConfig, EncoderClassifier, Tap};
pub use scoring::{score, ScoreReport, ScoreRow};
pub use training::{fit, ContrastiveLoss, PairSampler, SamplingPolicy};
