//! Backbone classifier, the encoder/classifier interface the contrastive step
//! trains through, and the tensor bridge between dataset rows and burn tensors.

pub mod backbone;
pub mod bridge;

use burn::prelude::*;

pub use backbone::{Backbone, BackboneConfig, Reduction, Tap, TapPoint, TappedOutput};

/// A shared backbone seen as an encoder plus a classification head.
///
/// `embed` is the backbone with its head stripped; `classify` runs the head on
/// top of the same encoder.
pub trait EncoderClassifier<B: Backend> {
    /// `(batch, d_input)` → `(batch, d_embedding)`.
    fn embed(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2>;

    /// `(batch, d_input)` → `(batch, num_classes)` logits.
    fn classify(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2>;
}
