//! Training loop: mini-batch construction, accumulating steps, AdamW updates,
//! per-epoch validation, checkpoints and the metric history.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::group_loss::{GroupLoss, GroupStatsLoss};
use super::loss::{cross_entropy_per_example, ContrastiveLoss};
use super::metrics::{EvalMetrics, MetricSink, MetricsHistory, RunningAvg, TracingSink};
use super::sampler::{PairSampler, SamplingPolicy};
use super::step::AccumulatingStep;
use crate::config::RunConfig;
use crate::data::weights::{class_balance_weights, class_loss_weights};
use crate::data::{robust_sampler_weights, BatchSampler, Dataset, Split};
use crate::error::CncError;
use crate::model::bridge::{inputs_to_tensor, targets_to_tensor, tensor_to_rows, tensor_to_vec};
use crate::model::{Backbone, BackboneConfig, EncoderClassifier};

/// Metadata saved alongside each checkpoint.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub step: usize,
    pub epoch: usize,
    pub method: String,
    pub valid_accuracy: Option<f64>,
}

/// Trained model plus what the run recorded.
#[derive(Debug)]
pub struct FitOutput<B: Backend> {
    pub model: Backbone<B>,
    pub history: MetricsHistory,
    pub save_dir: PathBuf,
    pub best_valid_accuracy: Option<f64>,
}

/// Training and validation collections after split selection and filtering.
#[derive(Debug, Clone)]
pub struct PreparedSplits {
    pub train: Dataset,
    pub valid: Dataset,
}

/// Select the configured splits and apply `gaze_split` / `multiclass`.
pub fn prepare_splits(dataset: &Dataset, config: &RunConfig) -> anyhow::Result<PreparedSplits> {
    let split = |name: &str| {
        Split::from_name(name).ok_or_else(|| CncError::Config(format!("unknown split `{name}`")))
    };
    let mut train = dataset.split(split(&config.dataset.train_split)?);
    let mut valid = dataset.split(split(&config.dataset.valid_split)?);

    if config.train.gaze_split {
        let before = train.len();
        train = train.filter(|e| e.group_id >= 0);
        tracing::info!(kept = train.len(), dropped = before - train.len(), "Restricted training to labelled subgroups");
    }
    if config.train.multiclass {
        train = train.with_group_targets();
        valid = valid.with_group_targets();
    }
    if train.is_empty() {
        return Err(CncError::Config("training split is empty".into()).into());
    }
    Ok(PreparedSplits { train, valid })
}

/// Mini-batch sampler for the configured draw mode over `pool`.
pub fn build_batch_sampler(
    train: &Dataset,
    pool: Vec<usize>,
    config: &RunConfig,
) -> anyhow::Result<BatchSampler> {
    let tc = &config.train;
    let num_samples = tc.samples_per_epoch.unwrap_or(pool.len());
    let sampler = if tc.loss.robust_sampler {
        let weights = robust_sampler_weights(&train.group_ids(&pool), tc.loss.reweight_class_alpha);
        BatchSampler::weighted(pool, &weights, tc.batch_size, num_samples)?
    } else if tc.weighted_sampling {
        let weights = class_balance_weights(&train.targets(&pool));
        BatchSampler::weighted(pool, &weights, tc.batch_size, num_samples)?
    } else if tc.samples_per_epoch.is_some() {
        BatchSampler::uniform(pool, tc.batch_size, num_samples)
    } else {
        BatchSampler::shuffled(pool, tc.batch_size)
    };
    Ok(sampler)
}

/// Train a backbone on `dataset`.
///
/// Exactly one of `model` and `config` may be given: a model alone trains
/// with the default configuration, a config alone builds (or resumes) the
/// model it describes, and neither uses defaults throughout.
///
/// # Errors
/// [`CncError::ModelAndConfig`] when both are supplied; configuration,
/// data and checkpoint IO errors otherwise.
pub fn fit<B: AutodiffBackend>(
    dataset: &Dataset,
    model: Option<Backbone<B>>,
    config: Option<RunConfig>,
    device: &B::Device,
) -> anyhow::Result<FitOutput<B>> {
    let (model, config) = match (model, config) {
        (Some(_), Some(_)) => return Err(CncError::ModelAndConfig.into()),
        (Some(model), None) => (Some(model), RunConfig::default()),
        (None, config) => (None, config.unwrap_or_default()),
    };
    config.validate()?;
    let tc = &config.train;

    B::seed(tc.seed);
    let mut rng = StdRng::seed_from_u64(tc.seed);

    let PreparedSplits { mut train, valid } = prepare_splits(dataset, &config)?;
    let input_dim = train.input_dim()?;

    let mut model = match model {
        Some(model) => model,
        None => {
            if input_dim != config.model.d_input {
                return Err(CncError::Config(format!(
                    "model.d_input is {} but examples have {input_dim} features",
                    config.model.d_input
                ))
                .into());
            }
            let backbone_config = config.backbone_config();
            match &config.model.resume_ckpt {
                Some(path) => resume_from_checkpoint(path, &backbone_config, device)?,
                None => backbone_config.init::<B>(device),
            }
        }
    };

    // Contrastive sampling setup. Identity-match anchors come from the
    // majority groups only, and unlabelled examples never reach the strata.
    let policy = tc.method.sampling_policy();
    if policy == Some(SamplingPolicy::IdentityMatch) {
        let before = train.len();
        train = train.filter(|e| e.group_id >= 0);
        if train.len() < before {
            tracing::info!(dropped = before - train.len(), "Excluded unlabelled examples from identity-match training");
        }
    }
    let pair_sampler = policy
        .map(|p| PairSampler::new(p, &train, tc.cnc.num_positive, tc.cnc.num_negative))
        .transpose()?;
    let pool: Vec<usize> = match pair_sampler.as_ref().and_then(PairSampler::strata) {
        Some(strata) => strata.majority(),
        None => (0..train.len()).collect(),
    };
    let batch_sampler = build_batch_sampler(&train, pool, &config)?;
    if batch_sampler.batches_per_epoch() == 0 {
        return Err(CncError::Config(format!(
            "batch_size {} leaves no full batch from a pool of {}",
            tc.batch_size,
            batch_sampler.pool().len()
        ))
        .into());
    }

    let n_groups = config.num_groups();
    let mut class_loss = GroupStatsLoss::new(n_groups);
    if tc.loss.reweight_class {
        let all: Vec<usize> = (0..train.len()).collect();
        let weights = class_loss_weights(
            &train.targets(&all),
            config.effective_num_classes(),
            tc.loss.reweight_class_alpha,
        );
        tracing::info!(?weights, "Class-reweighted cross-entropy");
        class_loss = class_loss.with_class_weights(weights);
    }
    let mut valid_loss = GroupStatsLoss::new(n_groups);

    let contrastive_loss = ContrastiveLoss::new(tc.contrastive.temperature)?;
    let step_fn = match &pair_sampler {
        Some(sampler) => AccumulatingStep::contrastive(sampler, contrastive_loss, tc.contrastive.contrastive_weight),
        None => AccumulatingStep::erm(contrastive_loss),
    };

    let grad_clipping = tc.max_grad_norm.map(|n| GradientClippingConfig::Norm(n as f32));
    let mut optimizer = AdamWConfig::new()
        .with_weight_decay(tc.wd as f32)
        .with_grad_clipping(grad_clipping)
        .init::<B, Backbone<B>>();

    let save_dir = config.save_dir();
    std::fs::create_dir_all(&save_dir)?;
    std::fs::write(save_dir.join("config.toml"), toml::to_string(&config)?)?;

    tracing::info!(
        method = %tc.method,
        train = train.len(),
        valid = valid.len(),
        pool = batch_sampler.pool().len(),
        batches_per_epoch = batch_sampler.batches_per_epoch(),
        save_dir = %save_dir.display(),
        "Starting training"
    );

    let mut history = MetricsHistory::new();
    let mut tracing_sink = TracingSink::default();
    let mut running_avg = RunningAvg::new();
    let mut best_valid_accuracy: Option<f64> = None;
    let mut last_valid_accuracy: Option<f64> = None;
    let train_start = Instant::now();
    let mut step = 0usize;

    for epoch in 0..tc.max_epochs {
        for batch in batch_sampler.epoch_batches(&mut rng) {
            let out = step_fn.run::<B, _>(&model, &train, &batch, &mut class_loss, &mut rng, device)?;
            model = optimizer.step(tc.lr, model, out.grads);
            running_avg.update(&out.metrics);
            step += 1;

            if tc.log_interval > 0 && step % tc.log_interval == 0 {
                if let Some(avg) = running_avg.avg_metrics() {
                    let warnings = avg.health_check();
                    if !warnings.is_empty() {
                        tracing::warn!(step, "Health check warnings: {:?}", warnings);
                    }
                    let mut sink = (&mut history, &mut tracing_sink);
                    sink.set_step(step);
                    avg.log(&mut sink);
                    GroupLoss::<B>::log_stats(&mut class_loss, &mut sink, true);
                }
                tracing::info!(step, epoch, "avg({}) {}", running_avg.count(), running_avg.display());
                running_avg.reset();
            }

            if tc.checkpoint_interval > 0 && step % tc.checkpoint_interval == 0 {
                let meta = CheckpointMeta {
                    step,
                    epoch,
                    method: tc.method.to_string(),
                    valid_accuracy: last_valid_accuracy,
                };
                save_checkpoint(&save_dir.join(format!("step_{step}")), &model, &optimizer, &meta)?;
            }
        }

        if valid.is_empty() {
            continue;
        }
        let valid_model = model.valid();
        let metrics = evaluate(&valid_model, &valid, tc.batch_size, &mut valid_loss, device)?;
        let mut sink = (&mut history, &mut tracing_sink);
        sink.set_step(step);
        metrics.log("valid", &mut sink);
        GroupLoss::<B::InnerBackend>::log_stats(&mut valid_loss, &mut sink, false);
        tracing::info!(
            epoch,
            step,
            valid_loss = format!("{:.4}", metrics.loss),
            valid_accuracy = format!("{:.4}", metrics.accuracy),
            valid_auroc = metrics.auroc.map(|a| format!("{a:.4}")).unwrap_or_default(),
            worst_group = metrics.worst_group_accuracy.map(|a| format!("{a:.4}")).unwrap_or_default(),
            "Validation"
        );

        last_valid_accuracy = Some(metrics.accuracy);
        if best_valid_accuracy.map_or(true, |best| metrics.accuracy > best) {
            best_valid_accuracy = Some(metrics.accuracy);
            let meta = CheckpointMeta {
                step,
                epoch,
                method: tc.method.to_string(),
                valid_accuracy: Some(metrics.accuracy),
            };
            save_checkpoint(&save_dir.join("best"), &model, &optimizer, &meta)?;
            tracing::info!(epoch, accuracy = metrics.accuracy, "New best validation accuracy");
        }
    }

    tracing::info!(
        steps = step,
        epochs = tc.max_epochs,
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training loop finished"
    );

    let meta = CheckpointMeta {
        step,
        epoch: tc.max_epochs,
        method: tc.method.to_string(),
        valid_accuracy: last_valid_accuracy,
    };
    save_checkpoint(&save_dir.join("final"), &model, &optimizer, &meta)?;
    history.save(&save_dir.join("metrics.json"))?;
    tracing::info!(save_dir = %save_dir.display(), "Training complete. Final checkpoint saved (model + optimizer + meta).");

    Ok(FitOutput {
        model,
        history,
        save_dir,
        best_valid_accuracy,
    })
}

/// Evaluate `model` over every example of `dataset` without gradients.
///
/// `class_loss` accumulates per-group statistics for a later `log_stats`.
pub fn evaluate<B: Backend>(
    model: &Backbone<B>,
    dataset: &Dataset,
    batch_size: usize,
    class_loss: &mut dyn GroupLoss<B>,
    device: &B::Device,
) -> anyhow::Result<EvalMetrics> {
    let mut probs: Vec<Vec<f64>> = Vec::with_capacity(dataset.len());
    let mut losses: Vec<f64> = Vec::with_capacity(dataset.len());
    let all: Vec<usize> = (0..dataset.len()).collect();

    for chunk in all.chunks(batch_size.max(1)) {
        let logits = model.classify(inputs_to_tensor::<B>(dataset, chunk, device)?);
        let targets = dataset.targets(chunk);
        class_loss.loss(logits.clone(), &targets, &dataset.group_ids(chunk))?;

        let per_example = cross_entropy_per_example(logits.clone(), targets_to_tensor::<B>(&targets, device));
        losses.extend(tensor_to_vec(per_example)?);
        probs.extend(
            tensor_to_rows(softmax(logits, 1))?
                .into_iter()
                .map(|row| row.into_iter().map(f64::from).collect::<Vec<f64>>()),
        );
    }

    Ok(EvalMetrics::compute(
        &probs,
        &dataset.targets(&all),
        &dataset.group_ids(&all),
        &losses,
    ))
}

fn save_checkpoint<B, O>(
    dir: &Path,
    model: &Backbone<B>,
    optimizer: &O,
    meta: &CheckpointMeta,
) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<Backbone<B>, B>,
{
    std::fs::create_dir_all(dir)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

    model
        .clone()
        .save_file(dir.join("model"), &recorder)
        .map_err(|e| anyhow::anyhow!("Failed to save model to {}: {e}", dir.display()))?;
    Recorder::<B>::record(&recorder, optimizer.to_record(), dir.join("optimizer"))
        .map_err(|e| anyhow::anyhow!("Failed to save optimizer to {}: {e}", dir.display()))?;
    serde_json::to_writer_pretty(std::fs::File::create(dir.join("meta.json"))?, meta)?;

    tracing::info!(step = meta.step, dir = %dir.display(), "Checkpoint saved (model + optimizer + meta)");
    Ok(())
}

/// Load a backbone from a checkpoint file.
///
/// Creates a fresh model from config, then loads saved weights on top.
pub fn resume_from_checkpoint<B: Backend>(
    path: &Path,
    config: &BackboneConfig,
    device: &B::Device,
) -> anyhow::Result<Backbone<B>> {
    let model = config
        .init::<B>(device)
        .load_file(path, &NamedMpkFileRecorder::<FullPrecisionSettings>::new(), device)
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded backbone weights");
    Ok(model)
}

/// Read the metadata written next to a checkpoint.
pub fn load_checkpoint_meta(dir: &Path) -> anyhow::Result<CheckpointMeta> {
    let path = dir.join("meta.json");
    let file = std::fs::File::open(&path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
    serde_json::from_reader(file).map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Method;
    use crate::data::Example;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::backend::Autodiff;

    type TestBackend = Autodiff<NdArray<f32>>;

    /// Four groups, two features; feature 0 carries the target, feature 1 the attribute.
    fn toy_dataset() -> Dataset {
        let mut examples = Vec::new();
        let counts = [(0, 12), (1, 4), (2, 4), (3, 12)];
        let mut id = 0;
        for split in [Split::Train, Split::Valid] {
            for &(g, n) in &counts {
                for k in 0..n {
                    let target = (g % 2) as u32;
                    let attr = (g / 2) as f32;
                    let jitter = (k as f32 * 0.37).sin() * 0.1;
                    examples.push(Example {
                        id: format!("ex{id}"),
                        input: vec![target as f32 * 2.0 - 1.0 + jitter, attr + jitter],
                        target,
                        group_id: g,
                        gaze_features: Some(vec![jitter, k as f32]),
                        split,
                    });
                    id += 1;
                }
            }
        }
        Dataset::new(examples)
    }

    fn toy_config(results_root: &Path, method: Method) -> RunConfig {
        let mut config = RunConfig::default();
        config.train.method = method;
        config.train.max_epochs = 2;
        config.train.batch_size = 4;
        config.train.lr = 1e-2;
        config.train.cnc.num_positive = 2;
        config.train.cnc.num_negative = 2;
        config.dataset.subgroup_columns = vec!["attr".into()];
        config.model.d_input = 2;
        config.model.d_hidden = 8;
        config.model.d_embedding = 4;
        config.output.results_root = results_root.to_path_buf();
        config
    }

    #[test]
    fn test_model_and_config_rejected() {
        let device = NdArrayDevice::default();
        let model = BackboneConfig::new(2, 2).init::<TestBackend>(&device);
        let err = fit(&toy_dataset(), Some(model), Some(RunConfig::default()), &device).unwrap_err();
        assert!(matches!(err.downcast_ref::<CncError>(), Some(CncError::ModelAndConfig)));
    }

    #[test]
    fn test_fit_cnc_writes_checkpoints_and_metrics() {
        let device = NdArrayDevice::default();
        let tmp = tempfile::tempdir().unwrap();
        let mut config = toy_config(tmp.path(), Method::Cnc);
        config.train.checkpoint_interval = 3;

        let out = fit::<TestBackend>(&toy_dataset(), None, Some(config), &device).unwrap();
        // 24 majority anchors / batch 4 = 6 steps per epoch
        assert_eq!(out.history.series("loss").len(), 12);
        assert!(out.history.last("train/robust_acc").is_some());
        assert!(out.history.last("valid_accuracy").is_some());
        assert!(out.history.last("valid/worst_group_acc").is_some());
        assert!(out.best_valid_accuracy.is_some());

        for dir in ["final", "best", "step_3", "step_12"] {
            let ckpt = out.save_dir.join(dir);
            assert!(ckpt.join("model.mpk").exists(), "missing {dir}/model.mpk");
            assert!(ckpt.join("optimizer.mpk").exists());
        }
        let meta = load_checkpoint_meta(&out.save_dir.join("final")).unwrap();
        assert_eq!(meta.step, 12);
        assert_eq!(meta.method, "cnc");
        assert!(out.save_dir.join("metrics.json").exists());
        assert!(out.save_dir.join("config.toml").exists());
        assert!(out.save_dir.ends_with("cw_0.5/seed_42"));
    }

    #[test]
    fn test_fit_erm_and_resume() {
        let device = NdArrayDevice::default();
        let tmp = tempfile::tempdir().unwrap();
        let config = toy_config(tmp.path(), Method::Erm);
        let out = fit::<TestBackend>(&toy_dataset(), None, Some(config.clone()), &device).unwrap();
        // all 32 training examples / batch 4 = 8 steps per epoch
        assert_eq!(out.history.series("train_loss").len(), 16);
        assert_eq!(out.history.last("contrastive_loss"), Some(0.0));

        let ckpt = out.save_dir.join("final").join("model");
        let restored = resume_from_checkpoint::<NdArray<f32>>(&ckpt, &config.backbone_config(), &device).unwrap();
        let valid = toy_dataset().split(Split::Valid);
        let mut loss = GroupStatsLoss::new(4);
        let a = evaluate(&out.model.valid(), &valid, 8, &mut loss, &device).unwrap();
        let b = evaluate(&restored, &valid, 8, &mut loss, &device).unwrap();
        assert!((a.loss - b.loss).abs() < 1e-6);
    }

    #[test]
    fn test_fit_robust_sampler_with_gaze_policy() {
        let device = NdArrayDevice::default();
        let tmp = tempfile::tempdir().unwrap();
        let mut config = toy_config(tmp.path(), Method::CncGaze);
        config.train.loss.robust_sampler = true;
        config.train.samples_per_epoch = Some(16);
        config.train.batch_size = 8;
        config.train.max_epochs = 1;
        let out = fit::<TestBackend>(&toy_dataset(), None, Some(config), &device).unwrap();
        assert_eq!(out.history.series("skipped_anchors").len(), 2);
    }

    #[test]
    fn test_input_dim_mismatch() {
        let device = NdArrayDevice::default();
        let tmp = tempfile::tempdir().unwrap();
        let mut config = toy_config(tmp.path(), Method::Erm);
        config.model.d_input = 5;
        assert!(fit::<TestBackend>(&toy_dataset(), None, Some(config), &device).is_err());
    }

    #[test]
    fn test_batch_sampler_modes() {
        let ds = toy_dataset().split(Split::Train);
        let pool: Vec<usize> = (0..ds.len()).collect();
        let mut config = RunConfig::default();
        config.train.batch_size = 4;
        assert_eq!(build_batch_sampler(&ds, pool.clone(), &config).unwrap().batches_per_epoch(), 8);

        config.train.samples_per_epoch = Some(40);
        assert_eq!(build_batch_sampler(&ds, pool.clone(), &config).unwrap().batches_per_epoch(), 10);

        config.train.weighted_sampling = true;
        assert_eq!(build_batch_sampler(&ds, pool, &config).unwrap().batches_per_epoch(), 10);
    }

    #[test]
    fn test_prepare_splits_gaze_and_multiclass() {
        let mut ds = toy_dataset();
        let mut examples = ds.examples().to_vec();
        examples[0].group_id = -1;
        ds = Dataset::new(examples);

        let mut config = RunConfig::default();
        config.dataset.subgroup_columns = vec!["attr".into()];
        config.train.gaze_split = true;
        config.train.multiclass = true;
        let splits = prepare_splits(&ds, &config).unwrap();
        assert_eq!(splits.train.len(), 31);
        let all: Vec<usize> = (0..splits.train.len()).collect();
        assert!(splits.train.targets(&all).iter().any(|&t| t == 3));
    }
}
