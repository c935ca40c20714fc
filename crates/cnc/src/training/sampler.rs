//! Positive/negative companion selection for contrastive anchors.
//!
//! Three interchangeable policies produce the same [`ContrastiveTuple`] shape:
//!
//! - **Identity match**: companions drawn with replacement from the strata
//!   fixed by the anchor's group (see [`crate::data::partition`]).
//! - **Feature proximity**: same-label mini-batch members split at the
//!   median auxiliary-feature distance from the anchor; near ones become
//!   positives, far ones negatives.
//! - **Random control**: feature proximity with uniform random distances.
//!
//! Proximity policies skip anchors with fewer than [`MIN_COMPANIONS`]
//! positives or negatives. Skips are reported as `None`, never as errors.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::{Dataset, Strata, Stratum};
use crate::error::{CncError, Result};

/// Minimum positives and negatives a proximity-sampled anchor needs.
pub const MIN_COMPANIONS: usize = 2;

/// Which companion policy a contrastive run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingPolicy {
    IdentityMatch,
    FeatureProximity,
    RandomControl,
}

impl std::fmt::Display for SamplingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::IdentityMatch => "identity_match",
            Self::FeatureProximity => "feature_proximity",
            Self::RandomControl => "random_control",
        };
        f.write_str(name)
    }
}

/// One anchor with its companions, all as dataset positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContrastiveTuple {
    pub anchor: usize,
    pub positives: Vec<usize>,
    pub negatives: Vec<usize>,
}

/// Companion sampler, one variant per [`SamplingPolicy`].
#[derive(Debug, Clone)]
pub enum PairSampler {
    IdentityMatch {
        strata: Strata,
        num_positive: usize,
        num_negative: usize,
    },
    FeatureProximity,
    RandomControl,
}

impl PairSampler {
    /// Build the sampler for `policy` over the training collection.
    ///
    /// Identity match partitions `dataset` once; the strata are reused for
    /// every epoch.
    pub fn new(
        policy: SamplingPolicy,
        dataset: &Dataset,
        num_positive: usize,
        num_negative: usize,
    ) -> Result<Self> {
        Ok(match policy {
            SamplingPolicy::IdentityMatch => Self::IdentityMatch {
                strata: Strata::build(dataset)?,
                num_positive,
                num_negative,
            },
            SamplingPolicy::FeatureProximity => Self::FeatureProximity,
            SamplingPolicy::RandomControl => Self::RandomControl,
        })
    }

    pub fn policy(&self) -> SamplingPolicy {
        match self {
            Self::IdentityMatch { .. } => SamplingPolicy::IdentityMatch,
            Self::FeatureProximity => SamplingPolicy::FeatureProximity,
            Self::RandomControl => SamplingPolicy::RandomControl,
        }
    }

    /// Strata backing an identity-match sampler.
    pub fn strata(&self) -> Option<&Strata> {
        match self {
            Self::IdentityMatch { strata, .. } => Some(strata),
            _ => None,
        }
    }

    /// Draw companions for one identity-match anchor.
    ///
    /// # Errors
    /// - [`CncError::InvalidGroup`] / [`CncError::InvalidAnchorGroup`] if the
    ///   anchor is not from group 0 or 3.
    /// - [`CncError::EmptyStratum`] if a companion pool is empty.
    pub fn sample(
        &self,
        dataset: &Dataset,
        anchor: usize,
        rng: &mut impl Rng,
    ) -> Result<ContrastiveTuple> {
        let Self::IdentityMatch {
            strata,
            num_positive,
            num_negative,
        } = self
        else {
            return Err(CncError::Config(format!(
                "{} companions depend on the mini-batch; use resolve_batch",
                self.policy()
            )));
        };

        let example = dataset
            .get(anchor)
            .ok_or_else(|| CncError::Shape(format!("anchor {anchor} out of range")))?;
        let stratum =
            Stratum::from_group_id(example.group_id).ok_or_else(|| CncError::InvalidGroup {
                id: example.id.clone(),
                group_id: example.group_id,
            })?;
        let sources = strata.sources_for(stratum, &example.id)?;

        Ok(ContrastiveTuple {
            anchor,
            positives: draw_with_replacement(
                sources.positives,
                *num_positive,
                sources.positive_stratum,
                rng,
            )?,
            negatives: draw_with_replacement(
                sources.negatives,
                *num_negative,
                sources.negative_stratum,
                rng,
            )?,
        })
    }

    /// Resolve a tuple for every anchor of a mini-batch.
    ///
    /// Entry `i` belongs to `batch[i]`; `None` marks a skipped anchor.
    pub fn resolve_batch(
        &self,
        dataset: &Dataset,
        batch: &[usize],
        rng: &mut impl Rng,
    ) -> Result<Vec<Option<ContrastiveTuple>>> {
        match self {
            Self::IdentityMatch { .. } => batch
                .iter()
                .map(|&anchor| self.sample(dataset, anchor, &mut *rng).map(Some))
                .collect(),
            Self::FeatureProximity => {
                let features = batch_features(dataset, batch)?;
                (0..batch.len())
                    .map(|i| {
                        let distances = features
                            .iter()
                            .map(|f| euclidean(features[i], f))
                            .collect::<Result<Vec<f64>>>()?;
                        Ok(proximity_tuple(dataset, batch, i, &distances))
                    })
                    .collect()
            }
            Self::RandomControl => Ok((0..batch.len())
                .map(|i| {
                    let distances: Vec<f64> = (0..batch.len()).map(|_| rng.gen::<f64>()).collect();
                    proximity_tuple(dataset, batch, i, &distances)
                })
                .collect()),
        }
    }
}

fn draw_with_replacement(
    pool: &[usize],
    count: usize,
    stratum: Stratum,
    rng: &mut impl Rng,
) -> Result<Vec<usize>> {
    if pool.is_empty() {
        return Err(CncError::EmptyStratum(stratum));
    }
    Ok((0..count)
        .filter_map(|_| pool.choose(rng).copied())
        .collect())
}

fn batch_features<'a>(dataset: &'a Dataset, batch: &[usize]) -> Result<Vec<&'a [f32]>> {
    batch
        .iter()
        .map(|&i| {
            let example = dataset
                .get(i)
                .ok_or_else(|| CncError::Shape(format!("batch index {i} out of range")))?;
            example
                .gaze_features
                .as_deref()
                .ok_or_else(|| CncError::MissingFeatures(example.id.clone()))
        })
        .collect()
}

fn euclidean(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(CncError::Shape(format!(
            "auxiliary feature lengths differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt())
}

fn proximity_tuple(
    dataset: &Dataset,
    batch: &[usize],
    anchor_pos: usize,
    distances: &[f64],
) -> Option<ContrastiveTuple> {
    let targets = dataset.targets(batch);
    let (positives, negatives) = proximity_split(&targets, distances, anchor_pos)?;
    Some(ContrastiveTuple {
        anchor: batch[anchor_pos],
        positives: positives.into_iter().map(|p| batch[p]).collect(),
        negatives: negatives.into_iter().map(|p| batch[p]).collect(),
    })
}

/// Split the same-label members of a mini-batch around the median distance.
///
/// `targets[j]` and `distances[j]` describe batch position `j`; the anchor
/// sits at `anchor_pos` and its own distance is ignored. The threshold
/// `alpha` is the median distance over the other same-label members. Those
/// at distance `<= alpha` are positives and those at `> alpha` negatives.
/// Returns batch positions, or `None` if either side has fewer than
/// [`MIN_COMPANIONS`] members.
pub fn proximity_split(
    targets: &[u32],
    distances: &[f64],
    anchor_pos: usize,
) -> Option<(Vec<usize>, Vec<usize>)> {
    let label = *targets.get(anchor_pos)?;
    let others: Vec<usize> = (0..targets.len())
        .filter(|&j| j != anchor_pos && targets[j] == label)
        .collect();
    let alpha = median(others.iter().map(|&j| distances[j]).collect())?;

    let (positives, negatives): (Vec<usize>, Vec<usize>) =
        others.into_iter().partition(|&j| distances[j] <= alpha);

    if positives.len() < MIN_COMPANIONS || negatives.len() < MIN_COMPANIONS {
        return None;
    }
    Some((positives, negatives))
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Example, Split};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ex(id: usize, target: u32, group_id: i64, gaze: Option<Vec<f32>>) -> Example {
        Example {
            id: format!("ex{id}"),
            input: vec![id as f32],
            target,
            group_id,
            gaze_features: gaze,
            split: Split::Train,
        }
    }

    fn grouped_dataset() -> Dataset {
        // groups: 0 x4, 1 x3, 2 x3, 3 x4
        let groups = [0, 0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3, 3];
        Dataset::new(
            groups
                .iter()
                .enumerate()
                .map(|(i, &g)| ex(i, (g % 2) as u32, g, None))
                .collect(),
        )
    }

    #[test]
    fn test_identity_match_companion_groups() {
        let ds = grouped_dataset();
        let sampler = PairSampler::new(SamplingPolicy::IdentityMatch, &ds, 5, 3).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..20 {
            for anchor in [0, 1, 2, 3] {
                let tuple = sampler.sample(&ds, anchor, &mut rng).unwrap();
                assert_eq!(tuple.anchor, anchor);
                assert_eq!(tuple.positives.len(), 5);
                assert_eq!(tuple.negatives.len(), 3);
                assert!(ds.group_ids(&tuple.positives).iter().all(|&g| g == 2));
                assert!(ds.group_ids(&tuple.negatives).iter().all(|&g| g == 1));
            }
            for anchor in [10, 11, 12, 13] {
                let tuple = sampler.sample(&ds, anchor, &mut rng).unwrap();
                assert!(ds.group_ids(&tuple.positives).iter().all(|&g| g == 1));
                assert!(ds.group_ids(&tuple.negatives).iter().all(|&g| g == 2));
            }
        }
    }

    #[test]
    fn test_identity_match_same_label_companions() {
        let ds = grouped_dataset();
        let sampler = PairSampler::new(SamplingPolicy::IdentityMatch, &ds, 4, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let tuple = sampler.sample(&ds, 0, &mut rng).unwrap();
        let anchor_target = ds.get(0).unwrap().target;
        assert!(ds.targets(&tuple.positives).iter().all(|&t| t == anchor_target));
        assert!(ds.targets(&tuple.negatives).iter().all(|&t| t != anchor_target));
    }

    #[test]
    fn test_identity_match_rejects_minority_anchor() {
        let ds = grouped_dataset();
        let sampler = PairSampler::new(SamplingPolicy::IdentityMatch, &ds, 2, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            sampler.sample(&ds, 4, &mut rng),
            Err(CncError::InvalidAnchorGroup { group_id: 1, .. })
        ));
    }

    #[test]
    fn test_identity_match_empty_stratum() {
        let ds = Dataset::new(vec![ex(0, 0, 0, None), ex(1, 1, 1, None), ex(2, 1, 3, None)]);
        let sampler = PairSampler::new(SamplingPolicy::IdentityMatch, &ds, 2, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            sampler.sample(&ds, 0, &mut rng),
            Err(CncError::EmptyStratum(Stratum::MinorityB))
        ));
    }

    #[test]
    fn test_resolve_batch_identity_match() {
        let ds = grouped_dataset();
        let sampler = PairSampler::new(SamplingPolicy::IdentityMatch, &ds, 2, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let tuples = sampler.resolve_batch(&ds, &[3, 12], &mut rng).unwrap();
        assert_eq!(tuples.len(), 2);
        assert!(tuples.iter().all(Option::is_some));
        assert_eq!(tuples[1].as_ref().unwrap().anchor, 12);
    }

    #[test]
    fn test_proximity_split_median_example() {
        // Anchor plus four same-label members at 0, 1, 2, 3: alpha = 1.5.
        let targets = [0, 0, 0, 0, 0];
        let distances = [0.0, 0.0, 1.0, 2.0, 3.0];
        let (pos, neg) = proximity_split(&targets, &distances, 0).unwrap();
        assert_eq!(pos, vec![1, 2]);
        assert_eq!(neg, vec![3, 4]);

        // The anchor's own distance does not move the threshold.
        let distances = [9.0, 0.0, 1.0, 2.0, 3.0];
        assert_eq!(proximity_split(&targets, &distances, 0), Some((vec![1, 2], vec![3, 4])));
    }

    #[test]
    fn test_proximity_split_odd_member_count() {
        // Five others at 1..=5: alpha = 3, so the median member is a positive.
        let targets = [0; 6];
        let distances = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let (pos, neg) = proximity_split(&targets, &distances, 0).unwrap();
        assert_eq!(pos, vec![1, 2, 3]);
        assert_eq!(neg, vec![4, 5]);

        // Five same-label others plus one of the other label.
        let targets = [0, 0, 0, 0, 0, 1, 0];
        let distances = [0.0, 1.0, 1.0, 2.0, 3.0, 0.1, 4.0];
        // same-label distances: 1,1,2,3,4 → alpha = 2
        let (pos, neg) = proximity_split(&targets, &distances, 0).unwrap();
        assert_eq!(pos, vec![1, 2, 3]);
        assert_eq!(neg, vec![4, 6]);
    }

    #[test]
    fn test_proximity_split_ignores_other_labels() {
        let targets = [1, 0, 0, 1, 1, 1, 1];
        let distances = [0.0, 0.1, 0.1, 1.0, 1.0, 5.0, 6.0];
        let (pos, neg) = proximity_split(&targets, &distances, 0).unwrap();
        assert!(pos.iter().chain(&neg).all(|&j| targets[j] == 1));
        assert!(!pos.contains(&0) && !neg.contains(&0));
        assert_eq!(pos, vec![3, 4]);
        assert_eq!(neg, vec![5, 6]);
    }

    #[test]
    fn test_feature_proximity_resolves_from_gaze() {
        let gaze = |x: f32| Some(vec![x, 0.0]);
        let ds = Dataset::new(vec![
            ex(0, 0, 0, gaze(0.0)),
            ex(1, 0, 0, gaze(0.1)),
            ex(2, 0, 2, gaze(0.2)),
            ex(3, 0, 0, gaze(5.0)),
            ex(4, 0, 2, gaze(6.0)),
            ex(5, 1, 3, gaze(0.05)),
        ]);
        let sampler = PairSampler::new(SamplingPolicy::FeatureProximity, &ds, 4, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let batch = [0, 1, 2, 3, 4, 5];
        let tuples = sampler.resolve_batch(&ds, &batch, &mut rng).unwrap();
        // same-label distances from 0: 0.1, 0.2, 5, 6 → alpha = 2.6
        let first = tuples[0].as_ref().unwrap();
        assert_eq!(first.positives, vec![1, 2]);
        assert_eq!(first.negatives, vec![3, 4]);
        // The lone target-1 example has no companions.
        assert!(tuples[5].is_none());
    }

    #[test]
    fn test_feature_proximity_rejects_ragged_features() {
        let ds = Dataset::new(vec![
            ex(0, 0, 0, Some(vec![0.0, 1.0])),
            ex(1, 0, 0, Some(vec![0.5])),
        ]);
        let sampler = PairSampler::new(SamplingPolicy::FeatureProximity, &ds, 1, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            sampler.resolve_batch(&ds, &[0, 1], &mut rng),
            Err(CncError::Shape(_))
        ));
    }

    #[test]
    fn test_feature_proximity_requires_features() {
        let ds = Dataset::new(vec![ex(0, 0, 0, Some(vec![0.0])), ex(1, 0, 0, None)]);
        let sampler = PairSampler::new(SamplingPolicy::FeatureProximity, &ds, 1, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            sampler.resolve_batch(&ds, &[0, 1], &mut rng),
            Err(CncError::MissingFeatures(id)) if id == "ex1"
        ));
    }

    #[test]
    fn test_random_control_same_label_without_features() {
        let ds = Dataset::new((0..8).map(|i| ex(i, (i % 2) as u32, -1, None)).collect());
        let sampler = PairSampler::new(SamplingPolicy::RandomControl, &ds, 1, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let batch: Vec<usize> = (0..8).collect();
        let tuples = sampler.resolve_batch(&ds, &batch, &mut rng).unwrap();
        assert_eq!(tuples.len(), 8);
        // Four same-label members per anchor cannot yield 2 + 2 companions.
        assert!(tuples.iter().all(Option::is_none));

        let ds = Dataset::new((0..12).map(|i| ex(i, 0, -1, None)).collect());
        let batch: Vec<usize> = (0..12).collect();
        let tuples = sampler.resolve_batch(&ds, &batch, &mut rng).unwrap();
        for (i, tuple) in tuples.iter().enumerate() {
            let tuple = tuple.as_ref().unwrap();
            assert_eq!(tuple.anchor, i);
            assert!(!tuple.positives.contains(&i));
            assert!(!tuple.negatives.contains(&i));
            assert_eq!(tuple.positives.len() + tuple.negatives.len(), 11);
        }
    }

    #[test]
    fn test_sample_only_for_identity_match() {
        let ds = grouped_dataset();
        let sampler = PairSampler::new(SamplingPolicy::RandomControl, &ds, 1, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sampler.sample(&ds, 0, &mut rng).is_err());
        assert!(sampler.strata().is_none());
    }

    #[test]
    fn test_median() {
        assert_eq!(median(vec![]), None);
        assert_eq!(median(vec![3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(vec![0.0, 3.0, 1.0, 2.0]), Some(1.5));
    }
}
