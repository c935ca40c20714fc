//! Contrastive and classification losses.
//!
//! All functions are generic over `B: Backend` and operate on burn tensors.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;

use crate::error::{CncError, Result};

const NORM_EPS: f64 = 1e-8;

/// Loss and similarity statistics for one anchor.
#[derive(Debug, Clone)]
pub struct ContrastiveOutput<B: Backend> {
    /// Scalar loss, shape `(1,)`.
    pub loss: Tensor<B, 1>,
    /// Mean cosine similarity to the positives, shape `(1,)`.
    pub pos_sim: Tensor<B, 1>,
    /// Mean cosine similarity to the negatives, shape `(1,)`.
    pub neg_sim: Tensor<B, 1>,
}

/// Multi-positive, multi-negative InfoNCE over cosine similarities.
///
/// For one anchor with positives `p_1..p_P` and negatives `n_1..n_N`:
///
/// ```text
/// loss = -1/P Σ_i [ s(a,p_i)/T - log( exp(s(a,p_i)/T) + Σ_j exp(s(a,n_j)/T) ) ]
/// ```
///
/// computed as a cross-entropy over a `(P, 1 + N)` logit matrix whose first
/// column holds the positive, so large `1/T` never overflows.
#[derive(Debug, Clone, Copy)]
pub struct ContrastiveLoss {
    temperature: f64,
}

impl ContrastiveLoss {
    /// # Errors
    /// [`CncError::NonPositiveTemperature`] unless `temperature` is finite and `> 0`.
    pub fn new(temperature: f64) -> Result<Self> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(CncError::NonPositiveTemperature(temperature));
        }
        Ok(Self { temperature })
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Loss for a single anchor.
    ///
    /// # Arguments
    /// - `anchor`: shape `(1, d)`
    /// - `positives`: shape `(P, d)`, `P >= 1`
    /// - `negatives`: shape `(N, d)`, `N >= 1`
    pub fn forward<B: Backend>(
        &self,
        anchor: Tensor<B, 2>,
        positives: Tensor<B, 2>,
        negatives: Tensor<B, 2>,
    ) -> ContrastiveOutput<B> {
        let device = anchor.device();
        let [num_pos, _] = positives.dims();
        let [num_neg, _] = negatives.dims();

        let pos_sim = cosine_similarity(anchor.clone(), positives); // (P,)
        let neg_sim = cosine_similarity(anchor, negatives); // (N,)

        let pos_logits = pos_sim.clone().div_scalar(self.temperature).reshape([num_pos, 1]);
        // Every positive row sees the full negative set.
        let neg_logits = Tensor::<B, 2>::ones([num_pos, 1], &device)
            .matmul(neg_sim.clone().div_scalar(self.temperature).reshape([1, num_neg]));
        let logits = Tensor::cat(vec![pos_logits, neg_logits], 1); // (P, 1 + N)

        let labels = Tensor::<B, 1, Int>::zeros([num_pos], &device);
        let loss = CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, labels);

        ContrastiveOutput {
            loss,
            pos_sim: pos_sim.mean(),
            neg_sim: neg_sim.mean(),
        }
    }
}

/// Cosine similarity of one anchor row against every row of `others`.
///
/// `anchor`: `(1, d)`, `others`: `(K, d)` → `(K,)`.
pub fn cosine_similarity<B: Backend>(anchor: Tensor<B, 2>, others: Tensor<B, 2>) -> Tensor<B, 1> {
    let [k, _] = others.dims();
    let anchor = l2_normalize(anchor);
    let others = l2_normalize(others);
    others.matmul(anchor.transpose()).reshape([k])
}

fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    // Clamp before the root so all-zero rows keep finite gradients.
    let norm = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .clamp_min(NORM_EPS * NORM_EPS)
        .sqrt();
    x / norm
}

/// Unreduced cross-entropy, one value per row of `logits`.
///
/// `logits`: `(batch, classes)`, `targets`: `(batch,)` → `(batch,)`.
pub fn cross_entropy_per_example<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [batch, _] = logits.dims();
    let log_probs = log_softmax(logits, 1);
    log_probs
        .gather(1, targets.reshape([batch, 1]))
        .reshape([batch])
        .neg()
}
