//! Run configuration loaded from TOML.
//!
//! One file describes a whole experiment: which training method to use, the
//! contrastive and sampling hyperparameters, the dataset columns that define
//! groups, the backbone shape, and where results go. Every field carries a
//! default so partial files are accepted.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CncError, Result};
use crate::model::backbone::BackboneConfig;
use crate::training::sampler::SamplingPolicy;

/// Training method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Correct-N-Contrast with group-identity companions.
    Cnc,
    /// Contrastive companions chosen by gaze-feature proximity.
    CncGaze,
    /// Random-distance control for `CncGaze`.
    Randcon,
    /// Plain empirical risk minimisation.
    Erm,
    /// Image/gaze CLIP objective (parsed, not trained here).
    GazeClip,
    /// Segmentation objective (parsed, not trained here).
    Segmentation,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cnc => "cnc",
            Self::CncGaze => "cnc_gaze",
            Self::Randcon => "randcon",
            Self::Erm => "erm",
            Self::GazeClip => "gaze_clip",
            Self::Segmentation => "segmentation",
        };
        f.write_str(name)
    }
}

impl Method {
    /// Companion sampling policy for contrastive methods, `None` otherwise.
    pub fn sampling_policy(self) -> Option<SamplingPolicy> {
        match self {
            Self::Cnc => Some(SamplingPolicy::IdentityMatch),
            Self::CncGaze => Some(SamplingPolicy::FeatureProximity),
            Self::Randcon => Some(SamplingPolicy::RandomControl),
            Self::Erm | Self::GazeClip | Self::Segmentation => None,
        }
    }

    pub fn is_contrastive(self) -> bool {
        self.sampling_policy().is_some()
    }
}

/// Top-level structure matching `configs/cnc.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// `[train]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_method")]
    pub method: Method,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// AdamW weight decay.
    #[serde(default)]
    pub wd: f64,
    /// Gradient-norm clipping threshold; disabled when absent.
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Draws per epoch for the weighted/random samplers. Defaults to the pool size.
    #[serde(default)]
    pub samples_per_epoch: Option<usize>,
    /// Treat group ids as the classification targets.
    #[serde(default)]
    pub multiclass: bool,
    /// Restrict training to examples with labelled subgroup attributes.
    #[serde(default)]
    pub gaze_split: bool,
    /// Class-balanced draws (target 1 upweighted by the negative/positive ratio).
    #[serde(default)]
    pub weighted_sampling: bool,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Steps between periodic checkpoints; 0 disables them.
    #[serde(default)]
    pub checkpoint_interval: usize,
    #[serde(default)]
    pub contrastive: ContrastiveConfig,
    #[serde(default)]
    pub cnc: CncSamplingConfig,
    #[serde(default)]
    pub loss: LossConfig,
}

/// `[train.contrastive]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContrastiveConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Blend weight `w` in `(1 - w) * classification + w * contrastive`.
    #[serde(default = "default_contrastive_weight")]
    pub contrastive_weight: f64,
}

/// `[train.cnc]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CncSamplingConfig {
    #[serde(default = "default_num_anchor")]
    pub num_anchor: usize,
    #[serde(default = "default_num_positive")]
    pub num_positive: usize,
    #[serde(default = "default_num_negative")]
    pub num_negative: usize,
}

/// `[train.loss]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// Weight the cross-entropy by inverse class frequency.
    #[serde(default)]
    pub reweight_class: bool,
    /// Exponent shared by class reweighting and the robust sampler.
    #[serde(default = "default_reweight_alpha")]
    pub reweight_class_alpha: f64,
    /// Draw mini-batches with inverse group-frequency weights.
    #[serde(default)]
    pub robust_sampler: bool,
}

/// `[dataset]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Name of the target column, used in group names and the results path.
    #[serde(default = "default_target_column")]
    pub target_column: String,
    /// Binary subgroup attribute columns, in bit order.
    #[serde(default)]
    pub subgroup_columns: Vec<String>,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_train_split")]
    pub train_split: String,
    #[serde(default = "default_valid_split")]
    pub valid_split: String,
}

/// `[model]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Flattened input dimension.
    #[serde(default = "default_d_input")]
    pub d_input: usize,
    #[serde(default = "default_d_hidden")]
    pub d_hidden: usize,
    #[serde(default = "default_d_embedding")]
    pub d_embedding: usize,
    #[serde(default)]
    pub dropout: f64,
    /// Checkpoint to resume weights from.
    #[serde(default)]
    pub resume_ckpt: Option<PathBuf>,
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,
}

fn default_method() -> Method {
    Method::Cnc
}
fn default_seed() -> u64 {
    42
}
fn default_lr() -> f64 {
    1e-4
}
fn default_max_epochs() -> usize {
    50
}
fn default_batch_size() -> usize {
    16
}
fn default_log_interval() -> usize {
    1
}
fn default_temperature() -> f64 {
    0.05
}
fn default_contrastive_weight() -> f64 {
    0.5
}
fn default_num_anchor() -> usize {
    1
}
fn default_num_positive() -> usize {
    4
}
fn default_num_negative() -> usize {
    4
}
fn default_reweight_alpha() -> f64 {
    1.0
}
fn default_target_column() -> String {
    "target".to_string()
}
fn default_num_classes() -> usize {
    2
}
fn default_train_split() -> String {
    "train".to_string()
}
fn default_valid_split() -> String {
    "valid".to_string()
}
fn default_d_input() -> usize {
    64
}
fn default_d_hidden() -> usize {
    128
}
fn default_d_embedding() -> usize {
    64
}
fn default_results_root() -> PathBuf {
    PathBuf::from("results")
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            seed: default_seed(),
            lr: default_lr(),
            wd: 0.0,
            max_grad_norm: None,
            max_epochs: default_max_epochs(),
            batch_size: default_batch_size(),
            samples_per_epoch: None,
            multiclass: false,
            gaze_split: false,
            weighted_sampling: false,
            log_interval: default_log_interval(),
            checkpoint_interval: 0,
            contrastive: ContrastiveConfig::default(),
            cnc: CncSamplingConfig::default(),
            loss: LossConfig::default(),
        }
    }
}

impl Default for ContrastiveConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            contrastive_weight: default_contrastive_weight(),
        }
    }
}

impl Default for CncSamplingConfig {
    fn default() -> Self {
        Self {
            num_anchor: default_num_anchor(),
            num_positive: default_num_positive(),
            num_negative: default_num_negative(),
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            reweight_class: false,
            reweight_class_alpha: default_reweight_alpha(),
            robust_sampler: false,
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            target_column: default_target_column(),
            subgroup_columns: Vec::new(),
            num_classes: default_num_classes(),
            train_split: default_train_split(),
            valid_split: default_valid_split(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_input: default_d_input(),
            d_hidden: default_d_hidden(),
            d_embedding: default_d_embedding(),
            dropout: 0.0,
            resume_ckpt: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_root: default_results_root(),
        }
    }
}

impl RunConfig {
    /// Load and validate a run config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
        let config: RunConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
        config.validate()?;
        tracing::info!(path = %path.display(), method = %config.train.method, "Loaded run config");
        Ok(config)
    }

    /// Reject out-of-range values and conflicting options.
    pub fn validate(&self) -> Result<()> {
        let train = &self.train;
        match train.method {
            Method::GazeClip | Method::Segmentation => {
                return Err(CncError::UnsupportedMethod(train.method));
            }
            _ => {}
        }

        let t = train.contrastive.temperature;
        if !(t.is_finite() && t > 0.0) {
            return Err(CncError::Config(format!(
                "train.contrastive.temperature must be > 0, got {t}"
            )));
        }
        let w = train.contrastive.contrastive_weight;
        if !(0.0..=1.0).contains(&w) {
            return Err(CncError::Config(format!(
                "train.contrastive.contrastive_weight must be in [0, 1], got {w}"
            )));
        }
        for (name, value) in [
            ("train.batch_size", train.batch_size),
            ("train.cnc.num_anchor", train.cnc.num_anchor),
            ("train.cnc.num_positive", train.cnc.num_positive),
            ("train.cnc.num_negative", train.cnc.num_negative),
        ] {
            if value == 0 {
                return Err(CncError::Config(format!("{name} must be positive")));
            }
        }
        if train.weighted_sampling && train.loss.robust_sampler {
            return Err(CncError::Config(
                "weighted_sampling and loss.robust_sampler are mutually exclusive".into(),
            ));
        }
        if train.multiclass && train.loss.robust_sampler {
            return Err(CncError::Config(
                "multiclass training cannot use loss.robust_sampler".into(),
            ));
        }
        if self.dataset.num_classes == 0 {
            return Err(CncError::Config("dataset.num_classes must be positive".into()));
        }
        Ok(())
    }

    /// Number of distinct groups, `2^(1 + num_subgroups)`.
    pub fn num_groups(&self) -> usize {
        1 << (1 + self.dataset.subgroup_columns.len())
    }

    /// Number of classifier outputs, accounting for multiclass group targets.
    pub fn effective_num_classes(&self) -> usize {
        if self.train.multiclass {
            self.num_groups()
        } else {
            self.dataset.num_classes
        }
    }

    /// Backbone hyperparameters derived from the `[model]` section.
    pub fn backbone_config(&self) -> BackboneConfig {
        BackboneConfig::new(self.model.d_input, self.effective_num_classes())
            .with_d_hidden(self.model.d_hidden)
            .with_d_embedding(self.model.d_embedding)
            .with_dropout(self.model.dropout)
    }

    /// Results directory for this run, derived from the hyperparameters.
    pub fn save_dir(&self) -> PathBuf {
        let train = &self.train;
        let subgroups = if self.dataset.subgroup_columns.is_empty() {
            "none".to_string()
        } else {
            self.dataset
                .subgroup_columns
                .iter()
                .map(|name| format!("_{name}"))
                .collect()
        };

        let mut dir = self
            .output
            .results_root
            .join(format!("method_{}", train.method))
            .join(format!("gaze_split_{}", train.gaze_split))
            .join(format!("target_{}", self.dataset.target_column))
            .join(format!("subgroup_{subgroups}"))
            .join(format!("lr_{}", train.lr))
            .join(format!("wd_{}", train.wd))
            .join(format!("dropout_{}", self.model.dropout));
        if train.method != Method::Erm {
            dir = dir.join(format!("cw_{}", train.contrastive.contrastive_weight));
        }
        dir.join(format!("seed_{}", train.seed))
    }
}
