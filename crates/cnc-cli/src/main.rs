mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{ScoreArgs, SummaryArgs, TrainArgs};

/// cnc-train: Correct-N-Contrast training, scoring and dataset inspection.
#[derive(Parser)]
#[command(name = "cnc-train", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a backbone with the configured method.
    Train {
        /// Path to the run config TOML file.
        #[arg(long, default_value = "configs/cnc.toml")]
        config: PathBuf,
        /// Path to the JSONL dataset manifest.
        #[arg(long)]
        data: PathBuf,
        /// Override `output.results_root`.
        #[arg(long)]
        results_root: Option<PathBuf>,
        /// Override `train.seed`.
        #[arg(long)]
        seed: Option<u64>,
        /// Override `train.max_epochs`.
        #[arg(long)]
        max_epochs: Option<usize>,
    },
    /// Score a dataset with a trained checkpoint, optionally capturing activations.
    Score {
        #[arg(long, default_value = "configs/cnc.toml")]
        config: PathBuf,
        #[arg(long)]
        data: PathBuf,
        /// Model weights file (e.g. `<save_dir>/best/model.mpk`).
        #[arg(long)]
        checkpoint: PathBuf,
        /// Output JSONL file, one row per example.
        #[arg(long)]
        output: PathBuf,
        /// Activation to capture, `layer[:reduction]` with layer in
        /// hidden/embedding/logits and reduction in mean/max/l2. Repeatable.
        #[arg(long = "tap")]
        taps: Vec<String>,
        /// Restrict scoring to one split (train/valid/test).
        #[arg(long)]
        split: Option<String>,
        #[arg(long, default_value_t = 256)]
        batch_size: usize,
    },
    /// Print per-split group counts for a manifest.
    Summary {
        #[arg(long, default_value = "configs/cnc.toml")]
        config: PathBuf,
        #[arg(long)]
        data: PathBuf,
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            data,
            results_root,
            seed,
            max_epochs,
        } => pipeline::run_train(TrainArgs {
            config,
            data,
            results_root,
            seed,
            max_epochs,
        }),
        Command::Score {
            config,
            data,
            checkpoint,
            output,
            taps,
            split,
            batch_size,
        } => pipeline::run_score(ScoreArgs {
            config,
            data,
            checkpoint,
            output,
            taps,
            split,
            batch_size,
        }),
        Command::Summary { config, data, json } => {
            pipeline::run_summary(SummaryArgs { config, data, json })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_score_taps_repeatable() {
        let cli = Cli::parse_from([
            "cnc-train",
            "score",
            "--data",
            "d.jsonl",
            "--checkpoint",
            "best/model.mpk",
            "--output",
            "scores.jsonl",
            "--tap",
            "embedding",
            "--tap",
            "hidden:mean",
        ]);
        match cli.command {
            Command::Score { taps, batch_size, config, .. } => {
                assert_eq!(taps, vec!["embedding", "hidden:mean"]);
                assert_eq!(batch_size, 256);
                assert_eq!(config, PathBuf::from("configs/cnc.toml"));
            }
            _ => panic!("expected score"),
        }
    }
}
