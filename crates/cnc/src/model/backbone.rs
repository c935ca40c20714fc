use std::collections::HashMap;

use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

use super::EncoderClassifier;

/// Configuration for the classification backbone.
///
/// ```text
/// (batch, d_input)
///   → Linear(d_input→d_hidden) → ReLU → Dropout        [Hidden tap]
///   → Linear(d_hidden→d_embedding) → ReLU               [Embedding tap]
///   → Dropout → Linear(d_embedding→num_classes)          [Logits tap]
/// ```
///
/// The encoder is everything up to the embedding; the head is the final
/// dropout + linear layer.
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Flattened input dimension.
    pub d_input: usize,
    /// Number of output classes.
    pub num_classes: usize,
    #[config(default = 128)]
    pub d_hidden: usize,
    #[config(default = 64)]
    pub d_embedding: usize,
    /// Dropout probability for the hidden layer and the head.
    #[config(default = 0.0)]
    pub dropout: f64,
}

/// Shared encoder with a linear classification head.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub(crate) fc1: Linear<B>,
    pub(crate) fc2: Linear<B>,
    pub(crate) head: Linear<B>,
    dropout: Dropout,
    head_dropout: Dropout,
}

impl BackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        Backbone {
            fc1: LinearConfig::new(self.d_input, self.d_hidden).init(device),
            fc2: LinearConfig::new(self.d_hidden, self.d_embedding).init(device),
            head: LinearConfig::new(self.d_embedding, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            head_dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

/// Layer whose output a [`Tap`] captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapPoint {
    Hidden,
    Embedding,
    Logits,
}

impl TapPoint {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hidden" => Some(Self::Hidden),
            "embedding" => Some(Self::Embedding),
            "logits" => Some(Self::Logits),
            _ => None,
        }
    }
}

/// Reduction applied to a captured activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reduction {
    /// Mean over features, `(batch, 1)`.
    Mean,
    /// Max over features, `(batch, 1)`.
    Max,
    /// Unit-norm rows, shape unchanged.
    L2Normalize,
}

impl Reduction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mean" => Some(Self::Mean),
            "max" => Some(Self::Max),
            "l2" | "l2_normalize" => Some(Self::L2Normalize),
            _ => None,
        }
    }

    pub fn apply<B: Backend>(self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::Mean => x.mean_dim(1),
            Self::Max => x.max_dim(1),
            Self::L2Normalize => {
                let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
                x / norm
            }
        }
    }
}

/// A named capture request for [`Backbone::forward_tapped`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tap {
    pub name: String,
    pub point: TapPoint,
    pub reduction: Option<Reduction>,
}

impl Tap {
    pub fn new(name: impl Into<String>, point: TapPoint) -> Self {
        Self {
            name: name.into(),
            point,
            reduction: None,
        }
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = Some(reduction);
        self
    }

    /// Parse `layer[:reduction]`, e.g. `embedding:mean`. The full text is the tap name.
    pub fn parse(text: &str) -> Option<Self> {
        let (layer, reduction) = match text.split_once(':') {
            Some((layer, red)) => (layer, Some(Reduction::from_name(red)?)),
            None => (text, None),
        };
        Some(Self {
            name: text.to_string(),
            point: TapPoint::from_name(layer)?,
            reduction,
        })
    }
}

/// Logits plus every requested capture.
#[derive(Debug)]
pub struct TappedOutput<B: Backend> {
    pub logits: Tensor<B, 2>,
    pub captured: HashMap<String, Tensor<B, 2>>,
}

impl<B: Backend> Backbone<B> {
    fn hidden(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        self.dropout.forward(relu(self.fc1.forward(inputs)))
    }

    fn embedding_from_hidden(&self, hidden: Tensor<B, 2>) -> Tensor<B, 2> {
        relu(self.fc2.forward(hidden))
    }

    fn head(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        self.head.forward(self.head_dropout.forward(embedding))
    }

    /// Forward pass that also returns the activations named by `taps`.
    pub fn forward_tapped(&self, inputs: Tensor<B, 2>, taps: &[Tap]) -> TappedOutput<B> {
        let hidden = self.hidden(inputs);
        let embedding = self.embedding_from_hidden(hidden.clone());
        let logits = self.head(embedding.clone());

        let captured = taps
            .iter()
            .map(|tap| {
                let value = match tap.point {
                    TapPoint::Hidden => hidden.clone(),
                    TapPoint::Embedding => embedding.clone(),
                    TapPoint::Logits => logits.clone(),
                };
                let value = match tap.reduction {
                    Some(reduction) => reduction.apply(value),
                    None => value,
                };
                (tap.name.clone(), value)
            })
            .collect();

        TappedOutput { logits, captured }
    }
}

impl<B: Backend> EncoderClassifier<B> for Backbone<B> {
    fn embed(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        self.embedding_from_hidden(self.hidden(inputs))
    }

    fn classify(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        self.head(self.embed(inputs))
    }
}
