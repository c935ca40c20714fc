//! Example collections: group-id derivation, the JSONL manifest reader,
//! contrastive strata, and mini-batch draw weights.

pub mod dataset;
pub mod example;
pub mod partition;
pub mod weights;

pub use dataset::{Dataset, GroupSummary};
pub use example::{decode_group_id, encode_group_id, group_names, Example, Split, UNLABELED_GROUP};
pub use partition::{Strata, Stratum};
pub use weights::{robust_sampler_weights, BatchSampler};
