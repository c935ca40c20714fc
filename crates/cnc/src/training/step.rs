//! One accumulating training step.
//!
//! Contrastive anchors are processed one at a time: each anchor's tuple is
//! encoded, its loss computed and immediately backpropagated, and only the
//! resulting parameter gradients are kept. The tuple's activations and graph
//! are owned by [`anchor_backward`] and released when it returns, so peak
//! memory is bounded by a single tuple. The classification loss is then
//! computed over the whole mini-batch and backpropagated once more; gradients
//! from both passes add up in a [`GradientsAccumulator`].
//!
//! With contrastive weight `w` and `n` anchors in the mini-batch:
//!
//! ```text
//! step_loss = (1 - w) * classification + w * (1/n) Σ_i contrastive_i
//! ```
//!
//! Each anchor's loss is backpropagated scaled by `w / n` and the
//! classification loss by `1 - w`, so the accumulated gradient is exactly the
//! gradient of `step_loss`. Skipped anchors contribute zero but still count
//! in `n`.

use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, GradientsParams};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::Rng;

use super::group_loss::GroupLoss;
use super::loss::ContrastiveLoss;
use super::metrics::StepMetrics;
use super::sampler::{ContrastiveTuple, PairSampler};
use crate::data::Dataset;
use crate::error::Result;
use crate::model::bridge::{inputs_to_tensor, tensor_to_f64};
use crate::model::EncoderClassifier;

/// Gradients and statistics of one step, ready for the optimizer.
pub struct StepOutput {
    pub grads: GradientsParams,
    pub metrics: StepMetrics,
}

/// Sums over the anchors of one mini-batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContrastiveStats {
    pub loss_sum: f64,
    pub pos_sim_sum: f64,
    pub neg_sim_sum: f64,
    pub contributing: usize,
    pub skipped: usize,
}

/// Step configuration: the companion sampler (absent for ERM), the
/// contrastive loss and the blend weight.
#[derive(Debug, Clone, Copy)]
pub struct AccumulatingStep<'a> {
    sampler: Option<&'a PairSampler>,
    loss: ContrastiveLoss,
    contrastive_weight: f64,
}

impl<'a> AccumulatingStep<'a> {
    pub fn contrastive(
        sampler: &'a PairSampler,
        loss: ContrastiveLoss,
        contrastive_weight: f64,
    ) -> Self {
        Self {
            sampler: Some(sampler),
            loss,
            contrastive_weight,
        }
    }

    /// Plain classification; the contrastive weight is ignored.
    pub fn erm(loss: ContrastiveLoss) -> Self {
        Self {
            sampler: None,
            loss,
            contrastive_weight: 0.0,
        }
    }

    /// Run one step over the dataset positions in `batch`.
    pub fn run<B, M>(
        &self,
        model: &M,
        dataset: &Dataset,
        batch: &[usize],
        class_loss: &mut dyn GroupLoss<B>,
        rng: &mut impl Rng,
        device: &B::Device,
    ) -> Result<StepOutput>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + EncoderClassifier<B>,
    {
        let mut accumulator = GradientsAccumulator::<M>::new();
        let batch_len = batch.len().max(1) as f64;

        let Some(sampler) = self.sampler else {
            let train_loss = classification_backward::<B, M>(
                model,
                dataset,
                batch,
                1.0,
                class_loss,
                &mut accumulator,
                device,
            )?;
            return Ok(StepOutput {
                grads: accumulator.grads(),
                metrics: StepMetrics {
                    loss: train_loss,
                    train_loss,
                    ..Default::default()
                },
            });
        };

        let w = self.contrastive_weight;
        let tuples = sampler.resolve_batch(dataset, batch, rng)?;
        let stats = accumulate_contrastive::<B, M>(
            model,
            dataset,
            &tuples,
            &self.loss,
            w / batch_len,
            &mut accumulator,
            device,
        )?;
        if stats.skipped > 0 {
            tracing::debug!(
                skipped = stats.skipped,
                anchors = batch.len(),
                "Skipped anchors without enough companions"
            );
        }

        // Classification sees the anchors plus every resolved companion.
        let mut cls_indices = batch.to_vec();
        for tuple in tuples.iter().flatten() {
            cls_indices.extend_from_slice(&tuple.positives);
            cls_indices.extend_from_slice(&tuple.negatives);
        }
        let train_loss = classification_backward::<B, M>(
            model,
            dataset,
            &cls_indices,
            1.0 - w,
            class_loss,
            &mut accumulator,
            device,
        )?;

        let contrastive_loss = stats.loss_sum / batch_len;
        Ok(StepOutput {
            grads: accumulator.grads(),
            metrics: StepMetrics {
                loss: (1.0 - w) * train_loss + w * contrastive_loss,
                train_loss,
                contrastive_loss,
                positive_sim: stats.pos_sim_sum / batch_len,
                negative_sim: stats.neg_sim_sum / batch_len,
                skipped_anchors: stats.skipped as f64,
                anchors: batch.len() as f64,
            },
        })
    }
}

/// Backpropagate every resolved tuple separately, scaling each loss by `scale`.
///
/// `None` entries are counted as skipped.
pub fn accumulate_contrastive<B, M>(
    model: &M,
    dataset: &Dataset,
    tuples: &[Option<ContrastiveTuple>],
    loss: &ContrastiveLoss,
    scale: f64,
    accumulator: &mut GradientsAccumulator<M>,
    device: &B::Device,
) -> Result<ContrastiveStats>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + EncoderClassifier<B>,
{
    let mut stats = ContrastiveStats::default();
    for tuple in tuples {
        let Some(tuple) = tuple else {
            stats.skipped += 1;
            continue;
        };
        let anchor = anchor_backward::<B, M>(model, dataset, tuple, loss, scale, device)?;
        accumulator.accumulate(model, anchor.grads);
        stats.loss_sum += anchor.loss;
        stats.pos_sim_sum += anchor.pos_sim;
        stats.neg_sim_sum += anchor.neg_sim;
        stats.contributing += 1;
    }
    Ok(stats)
}

struct AnchorResult {
    grads: GradientsParams,
    loss: f64,
    pos_sim: f64,
    neg_sim: f64,
}

/// Encode one tuple, compute its loss and backpropagate it alone.
///
/// Embeddings and the autodiff graph live only inside this call.
fn anchor_backward<B, M>(
    model: &M,
    dataset: &Dataset,
    tuple: &ContrastiveTuple,
    loss: &ContrastiveLoss,
    scale: f64,
    device: &B::Device,
) -> Result<AnchorResult>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + EncoderClassifier<B>,
{
    let out = anchor_loss::<B, M>(model, dataset, tuple, loss, device)?;
    let value = tensor_to_f64(out.loss.clone());
    let pos_sim = tensor_to_f64(out.pos_sim);
    let neg_sim = tensor_to_f64(out.neg_sim);

    let grads = GradientsParams::from_grads(out.loss.mul_scalar(scale).backward(), model);
    Ok(AnchorResult {
        grads,
        loss: value,
        pos_sim,
        neg_sim,
    })
}

/// Contrastive loss of one tuple, encoding anchor and companions in one forward pass.
pub fn anchor_loss<B, M>(
    model: &M,
    dataset: &Dataset,
    tuple: &ContrastiveTuple,
    loss: &ContrastiveLoss,
    device: &B::Device,
) -> Result<super::loss::ContrastiveOutput<B>>
where
    B: Backend,
    M: EncoderClassifier<B>,
{
    let p = tuple.positives.len();
    let n = tuple.negatives.len();
    let mut indices = Vec::with_capacity(1 + p + n);
    indices.push(tuple.anchor);
    indices.extend_from_slice(&tuple.positives);
    indices.extend_from_slice(&tuple.negatives);

    let embeddings = model.embed(inputs_to_tensor::<B>(dataset, &indices, device)?);
    let [_, d] = embeddings.dims();
    let anchor = embeddings.clone().slice([0..1, 0..d]);
    let positives = embeddings.clone().slice([1..1 + p, 0..d]);
    let negatives = embeddings.slice([1 + p..1 + p + n, 0..d]);
    Ok(loss.forward(anchor, positives, negatives))
}

fn classification_backward<B, M>(
    model: &M,
    dataset: &Dataset,
    indices: &[usize],
    scale: f64,
    class_loss: &mut dyn GroupLoss<B>,
    accumulator: &mut GradientsAccumulator<M>,
    device: &B::Device,
) -> Result<f64>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + EncoderClassifier<B>,
{
    let logits = model.classify(inputs_to_tensor::<B>(dataset, indices, device)?);
    let loss = class_loss.loss(logits, &dataset.targets(indices), &dataset.group_ids(indices))?;
    let value = tensor_to_f64(loss.clone());
    let grads = GradientsParams::from_grads(loss.mul_scalar(scale).backward(), model);
    accumulator.accumulate(model, grads);
    Ok(value)
}
