//! Subcommand implementations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;

use cnc::data::{Dataset, GroupSummary, Split};
use cnc::model::Tap;
use cnc::training::resume_from_checkpoint;
use cnc::{fit, score, RunConfig};

type TrainBackend = Autodiff<NdArray<f32>>;
type ScoreBackend = NdArray<f32>;

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    pub config: PathBuf,
    pub data: PathBuf,
    pub results_root: Option<PathBuf>,
    pub seed: Option<u64>,
    pub max_epochs: Option<usize>,
}

/// Arguments for the `score` subcommand.
#[derive(Debug)]
pub struct ScoreArgs {
    pub config: PathBuf,
    pub data: PathBuf,
    pub checkpoint: PathBuf,
    pub output: PathBuf,
    /// Raw `layer[:reduction]` tap strings.
    pub taps: Vec<String>,
    pub split: Option<String>,
    pub batch_size: usize,
}

/// Arguments for the `summary` subcommand.
#[derive(Debug)]
pub struct SummaryArgs {
    pub config: PathBuf,
    pub data: PathBuf,
    pub json: bool,
}

/// Train with the configured method and print where results went.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut config = RunConfig::load(&args.config)?;
    if let Some(root) = args.results_root {
        config.output.results_root = root;
    }
    if let Some(seed) = args.seed {
        config.train.seed = seed;
    }
    if let Some(max_epochs) = args.max_epochs {
        config.train.max_epochs = max_epochs;
    }

    tracing::info!(
        seed = config.train.seed,
        max_epochs = config.train.max_epochs,
        results_root = %config.output.results_root.display(),
        "Effective run settings"
    );

    let dataset = Dataset::from_jsonl(&args.data, &config.dataset.subgroup_columns)?;
    let method = config.train.method;
    let device = NdArrayDevice::default();
    let out = fit::<TrainBackend>(&dataset, None, Some(config), &device)?;

    println!("--- Training Complete ---");
    println!("Method: {method}");
    println!("Results: {}", out.save_dir.display());
    match out.best_valid_accuracy {
        Some(acc) => println!("Best valid accuracy: {:.2}%", acc * 100.0),
        None => println!("Best valid accuracy: n/a (empty validation split)"),
    }
    if let Some(worst) = out.history.last("valid/worst_group_acc") {
        println!("Final worst-group accuracy: {:.2}%", worst * 100.0);
    }
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Score a manifest with a saved backbone and write JSONL rows.
pub fn run_score(args: ScoreArgs) -> anyhow::Result<()> {
    let config = RunConfig::load(&args.config)?;
    let taps: Vec<Tap> = args
        .taps
        .iter()
        .map(|raw| {
            Tap::parse(raw).ok_or_else(|| {
                anyhow::anyhow!("Invalid tap `{raw}`: expected layer[:reduction] with layer in hidden/embedding/logits")
            })
        })
        .collect::<anyhow::Result<_>>()?;

    let mut dataset = Dataset::from_jsonl(&args.data, &config.dataset.subgroup_columns)?;
    if let Some(name) = &args.split {
        let split = Split::from_name(name).ok_or_else(|| anyhow::anyhow!("Unknown split `{name}`"))?;
        dataset = dataset.split(split);
    }
    if config.train.multiclass {
        dataset = dataset.with_group_targets();
    }

    let device = NdArrayDevice::default();
    let model = resume_from_checkpoint::<ScoreBackend>(&args.checkpoint, &config.backbone_config(), &device)?;
    let report = score(&model, &dataset, &taps, args.batch_size, &device)?;
    report.write_jsonl(&args.output)?;

    println!("Scored: {} examples", report.len());
    if let Some(acc) = report.accuracy() {
        println!("Accuracy: {:.2}%", acc * 100.0);
    }
    println!("Output: {}", args.output.display());
    Ok(())
}

/// Print group counts per split.
pub fn run_summary(args: SummaryArgs) -> anyhow::Result<()> {
    let config = RunConfig::load(&args.config)?;
    let columns = &config.dataset.subgroup_columns;
    let dataset = Dataset::from_jsonl(&args.data, columns)?;

    let summaries: BTreeMap<String, GroupSummary> = [Split::Train, Split::Valid, Split::Test]
        .into_iter()
        .map(|split| {
            let summary = dataset
                .split(split)
                .group_summary(&config.dataset.target_column, columns);
            (split.to_string(), summary)
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!("--- Dataset Summary ---");
    println!("File: {}", args.data.display());
    println!("Examples: {}", dataset.len());
    for (split, summary) in &summaries {
        let total: usize = summary.group_counts.iter().sum::<usize>() + summary.unlabeled;
        println!();
        println!("[{split}] {total} examples, {} groups", summary.n_groups);
        for (name, count) in summary.group_str.iter().zip(&summary.group_counts) {
            println!("  {name:<40} {count}");
        }
        if summary.unlabeled > 0 {
            println!("  {:<40} {}", "unlabelled", summary.unlabeled);
        }
    }
    Ok(())
}
