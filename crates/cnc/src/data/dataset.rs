//! In-memory example collection and the JSONL manifest reader.
//!
//! Each manifest line describes one example:
//!
//! ```json
//! {"id": "img_001", "input": [0.1, 0.2], "target": 1,
//!  "subgroups": {"chest_tube": 0}, "gaze_features": [3.1, 0.4, 2.2, 1.0],
//!  "split": "train"}
//! ```
//!
//! Group ids are derived at load time from the configured subgroup columns.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::example::{group_id_for, group_names, Example, Split, UNLABELED_GROUP};
use crate::error::{CncError, Result};

#[derive(Deserialize)]
struct ManifestRecord {
    id: String,
    input: Vec<f32>,
    target: u32,
    #[serde(default)]
    subgroups: HashMap<String, Option<i64>>,
    #[serde(default)]
    gaze_features: Option<Vec<f32>>,
    split: Split,
}

/// Per-split group statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub n_groups: usize,
    pub group_counts: Vec<usize>,
    pub group_str: Vec<String>,
    /// Examples excluded from group logic (`group_id == -1`).
    pub unlabeled: usize,
}

/// An indexable collection of examples.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    examples: Vec<Example>,
}

impl Dataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    /// Read a JSONL manifest, deriving group ids from `subgroup_columns`.
    pub fn from_jsonl(path: &Path, subgroup_columns: &[String]) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);

        let mut examples = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ManifestRecord = serde_json::from_str(&line).map_err(|source| {
                CncError::Json {
                    line: line_no + 1,
                    source,
                }
            })?;

            let raw: Vec<Option<i64>> = subgroup_columns
                .iter()
                .map(|c| record.subgroups.get(c).copied().flatten())
                .collect();
            let group_id = group_id_for(&record.id, record.target, subgroup_columns, &raw)?;

            examples.push(Example {
                id: record.id,
                input: record.input,
                target: record.target,
                group_id,
                gaze_features: record.gaze_features,
                split: record.split,
            });
        }

        let dataset = Self::new(examples);
        dataset.input_dim()?;
        tracing::info!(
            path = %path.display(),
            examples = dataset.len(),
            unlabeled = dataset.iter().filter(|e| e.group_id == UNLABELED_GROUP).count(),
            "Loaded dataset manifest"
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Example> {
        self.examples.iter()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    /// Sub-collection of the examples matching `keep`.
    pub fn filter(&self, keep: impl Fn(&Example) -> bool) -> Self {
        Self::new(self.examples.iter().filter(|e| keep(e)).cloned().collect())
    }

    /// Sub-collection for one split.
    pub fn split(&self, split: Split) -> Self {
        self.filter(|e| e.split == split)
    }

    /// Replace every target by its group id, for multiclass training.
    ///
    /// Unlabelled examples cannot carry a group target and are dropped.
    pub fn with_group_targets(&self) -> Self {
        self.filter(|e| e.group_id >= 0).map(|e| Example {
            target: e.group_id as u32,
            ..e.clone()
        })
    }

    /// New collection with every example rewritten by `derive`.
    pub fn map(&self, derive: impl Fn(&Example) -> Example) -> Self {
        Self::new(self.examples.iter().map(derive).collect())
    }

    /// Common input dimension, or an error if rows disagree.
    pub fn input_dim(&self) -> Result<usize> {
        let Some(first) = self.examples.first() else {
            return Ok(0);
        };
        let dim = first.input.len();
        if let Some(bad) = self.examples.iter().find(|e| e.input.len() != dim) {
            return Err(CncError::Shape(format!(
                "example {} has input length {}, expected {dim}",
                bad.id,
                bad.input.len()
            )));
        }
        Ok(dim)
    }

    /// Group ids for a set of positions.
    pub fn group_ids(&self, indices: &[usize]) -> Vec<i64> {
        indices.iter().map(|&i| self.examples[i].group_id).collect()
    }

    /// Targets for a set of positions.
    pub fn targets(&self, indices: &[usize]) -> Vec<u32> {
        indices.iter().map(|&i| self.examples[i].target).collect()
    }

    /// Count examples per group for `n_groups` groups.
    pub fn group_summary(&self, target_column: &str, subgroup_columns: &[String]) -> GroupSummary {
        let names = group_names(target_column, subgroup_columns);
        let mut counts = vec![0usize; names.len()];
        let mut unlabeled = 0;
        for example in &self.examples {
            match usize::try_from(example.group_id) {
                Ok(g) if g < counts.len() => counts[g] += 1,
                _ => unlabeled += 1,
            }
        }
        GroupSummary {
            n_groups: names.len(),
            group_counts: counts,
            group_str: names,
            unlabeled,
        }
    }
}
