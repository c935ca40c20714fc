//! Majority/minority strata for Correct-N-Contrast.
//!
//! With one binary subgroup attribute the four groups play fixed roles:
//!
//! ```text
//! group 0: target 0, attribute 0  → majority (anchor source)
//! group 1: target 1, attribute 0  → minority A
//! group 2: target 0, attribute 1  → minority B
//! group 3: target 1, attribute 1  → majority (anchor source)
//! ```
//!
//! A group-0 anchor draws positives from group 2 (same target, other
//! attribute) and negatives from group 1 (other target, same attribute).
//! Group-3 anchors mirror this: positives from group 1, negatives from
//! group 2.

use std::fmt;

use super::dataset::Dataset;
use crate::error::{CncError, Result};

/// Role of a group in the contrastive partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stratum {
    Majority0 = 0,
    MinorityA = 1,
    MinorityB = 2,
    Majority1 = 3,
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, g) = match self {
            Self::Majority0 => ("majority-0", 0),
            Self::MinorityA => ("minority-A", 1),
            Self::MinorityB => ("minority-B", 2),
            Self::Majority1 => ("majority-1", 3),
        };
        write!(f, "{name} (group {g})")
    }
}

impl Stratum {
    pub fn from_group_id(group_id: i64) -> Option<Self> {
        match group_id {
            0 => Some(Self::Majority0),
            1 => Some(Self::MinorityA),
            2 => Some(Self::MinorityB),
            3 => Some(Self::Majority1),
            _ => None,
        }
    }

    pub fn is_majority(self) -> bool {
        matches!(self, Self::Majority0 | Self::Majority1)
    }
}

/// Companion pools for one anchor stratum.
#[derive(Debug, Clone, Copy)]
pub struct CompanionSources<'a> {
    pub positives: &'a [usize],
    pub negatives: &'a [usize],
    pub positive_stratum: Stratum,
    pub negative_stratum: Stratum,
}

/// Dataset positions grouped by stratum.
///
/// Built once per training run from the (read-only) training collection and
/// reused for every epoch.
#[derive(Debug, Clone, Default)]
pub struct Strata {
    majority_0: Vec<usize>,
    minority_a: Vec<usize>,
    minority_b: Vec<usize>,
    majority_1: Vec<usize>,
}

impl Strata {
    /// Partition every example of `dataset`.
    ///
    /// # Errors
    /// [`CncError::InvalidGroup`] if any example has a group id outside
    /// `0..=3`; unlabelled examples must be filtered out beforehand.
    pub fn build(dataset: &Dataset) -> Result<Self> {
        let mut strata = Self::default();
        for (i, example) in dataset.iter().enumerate() {
            let stratum =
                Stratum::from_group_id(example.group_id).ok_or_else(|| CncError::InvalidGroup {
                    id: example.id.clone(),
                    group_id: example.group_id,
                })?;
            strata.members_mut(stratum).push(i);
        }
        tracing::debug!(
            majority_0 = strata.majority_0.len(),
            minority_a = strata.minority_a.len(),
            minority_b = strata.minority_b.len(),
            majority_1 = strata.majority_1.len(),
            "Built contrastive strata"
        );
        Ok(strata)
    }

    pub fn members(&self, stratum: Stratum) -> &[usize] {
        match stratum {
            Stratum::Majority0 => &self.majority_0,
            Stratum::MinorityA => &self.minority_a,
            Stratum::MinorityB => &self.minority_b,
            Stratum::Majority1 => &self.majority_1,
        }
    }

    fn members_mut(&mut self, stratum: Stratum) -> &mut Vec<usize> {
        match stratum {
            Stratum::Majority0 => &mut self.majority_0,
            Stratum::MinorityA => &mut self.minority_a,
            Stratum::MinorityB => &mut self.minority_b,
            Stratum::Majority1 => &mut self.majority_1,
        }
    }

    /// Positions with `group_id ∈ {0, 3}`, in dataset order. Anchors come from here.
    pub fn majority(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self
            .majority_0
            .iter()
            .chain(&self.majority_1)
            .copied()
            .collect();
        all.sort_unstable();
        all
    }

    /// Positive and negative pools for an anchor of the given stratum.
    ///
    /// # Errors
    /// [`CncError::InvalidAnchorGroup`] for minority anchors.
    pub fn sources_for(&self, anchor: Stratum, anchor_id: &str) -> Result<CompanionSources<'_>> {
        let (positive_stratum, negative_stratum) = match anchor {
            Stratum::Majority0 => (Stratum::MinorityB, Stratum::MinorityA),
            Stratum::Majority1 => (Stratum::MinorityA, Stratum::MinorityB),
            Stratum::MinorityA | Stratum::MinorityB => {
                return Err(CncError::InvalidAnchorGroup {
                    id: anchor_id.to_string(),
                    group_id: anchor as i64,
                })
            }
        };
        Ok(CompanionSources {
            positives: self.members(positive_stratum),
            negatives: self.members(negative_stratum),
            positive_stratum,
            negative_stratum,
        })
    }
}
