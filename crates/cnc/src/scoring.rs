//! Batch scoring with activation taps.
//!
//! Runs a trained backbone over a dataset and collects, per example, the
//! softmax probabilities plus whatever intermediate activations the caller
//! asked for through [`Tap`]s.

use std::collections::BTreeMap;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;

use burn::prelude::*;
use burn::tensor::activation::softmax;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::data::Dataset;
use crate::error::Result;
use crate::model::bridge::{inputs_to_tensor, tensor_to_rows};
use crate::model::{Backbone, Tap};

/// Scores for one example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub id: String,
    pub target: u32,
    pub group_id: i64,
    pub probabilities: Vec<f32>,
    /// Tap name → captured (possibly reduced) activation row.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub captured: BTreeMap<String, Vec<f32>>,
}

impl ScoreRow {
    /// Index of the most probable class.
    pub fn predicted(&self) -> Option<usize> {
        self.probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }
}

/// Scores for a whole dataset, in dataset order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreReport {
    pub rows: Vec<ScoreRow>,
}

impl ScoreReport {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fraction of rows whose predicted class equals the target.
    pub fn accuracy(&self) -> Option<f64> {
        if self.rows.is_empty() {
            return None;
        }
        let correct = self
            .rows
            .iter()
            .filter(|r| r.predicted() == Some(r.target as usize))
            .count();
        Some(correct as f64 / self.rows.len() as f64)
    }

    /// Write one JSON object per line.
    pub fn write_jsonl(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for row in &self.rows {
            serde_json::to_writer(&mut writer, row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        tracing::info!(rows = self.rows.len(), path = %path.display(), "Wrote score report");
        Ok(())
    }

    pub fn read_jsonl(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        let mut rows = Vec::new();
        for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(&line)
                .map_err(|e| anyhow::anyhow!("{}:{}: {e}", path.display(), line_no + 1))?;
            rows.push(row);
        }
        Ok(Self { rows })
    }
}

/// Score every example of `dataset` in batches of `batch_size`.
pub fn score<B: Backend>(
    model: &Backbone<B>,
    dataset: &Dataset,
    taps: &[Tap],
    batch_size: usize,
    device: &B::Device,
) -> Result<ScoreReport> {
    let pb = ProgressBar::new(dataset.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) Scoring")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let all: Vec<usize> = (0..dataset.len()).collect();
    let mut rows = Vec::with_capacity(dataset.len());
    for chunk in all.chunks(batch_size.max(1)) {
        let out = model.forward_tapped(inputs_to_tensor::<B>(dataset, chunk, device)?, taps);
        let probabilities = tensor_to_rows(softmax(out.logits, 1))?;

        let mut captured: Vec<(String, Vec<Vec<f32>>)> = Vec::with_capacity(taps.len());
        for (name, value) in out.captured {
            captured.push((name, tensor_to_rows(value)?));
        }

        for (k, (&i, probs)) in chunk.iter().zip(probabilities).enumerate() {
            let example = &dataset.examples()[i];
            rows.push(ScoreRow {
                id: example.id.clone(),
                target: example.target,
                group_id: example.group_id,
                probabilities: probs,
                captured: captured
                    .iter()
                    .map(|(name, values)| (name.clone(), values[k].clone()))
                    .collect(),
            });
        }
        pb.inc(chunk.len() as u64);
    }
    pb.finish_with_message("done");

    tracing::info!(examples = rows.len(), taps = taps.len(), "Scoring complete");
    Ok(ScoreReport { rows })
}
