//! Labelled examples and the group-id bit-packing rule.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CncError, Result};

/// Group id assigned to examples with any unlabelled subgroup attribute.
pub const UNLABELED_GROUP: i64 = -1;

/// Dataset split tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Valid => write!(f, "valid"),
            Self::Test => write!(f, "test"),
        }
    }
}

impl Split {
    /// Parse from a config string. Returns `None` for unrecognised values.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "train" => Some(Self::Train),
            "valid" => Some(Self::Valid),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

/// A single labelled example.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// Stable identifier, carried into scores and error messages.
    pub id: String,
    /// Flattened input features (image decoding happens upstream).
    pub input: Vec<f32>,
    /// Class label.
    pub target: u32,
    /// Packed `(target, subgroup bits)` or [`UNLABELED_GROUP`].
    pub group_id: i64,
    /// Auxiliary features (gaze statistics) used by proximity sampling.
    pub gaze_features: Option<Vec<f32>>,
    pub split: Split,
}

/// Pack a target and binary subgroup attributes into a group id.
///
/// `group_id = target + Σ_i 2^(i+1) · attr_i`. Any missing attribute yields
/// [`UNLABELED_GROUP`]. With no subgroup columns the group id is the target.
pub fn encode_group_id(target: u32, attributes: &[Option<u8>]) -> i64 {
    let mut group_id = target as i64;
    for (i, attr) in attributes.iter().enumerate() {
        match attr {
            Some(bit) => group_id += (1_i64 << (i + 1)) * (*bit as i64),
            None => return UNLABELED_GROUP,
        }
    }
    group_id
}

/// Inverse of [`encode_group_id`] for binary targets.
///
/// Returns `None` for negative ids or ids that need more than
/// `num_subgroups + 1` bits.
pub fn decode_group_id(group_id: i64, num_subgroups: usize) -> Option<(u32, Vec<u8>)> {
    if group_id < 0 || group_id >= (1_i64 << (num_subgroups + 1)) {
        return None;
    }
    let target = (group_id & 1) as u32;
    let bits = (0..num_subgroups)
        .map(|i| ((group_id >> (i + 1)) & 1) as u8)
        .collect();
    Some((target, bits))
}

/// Validate raw attribute values and compute the group id for one example.
pub fn group_id_for(
    id: &str,
    target: u32,
    columns: &[String],
    raw_attributes: &[Option<i64>],
) -> Result<i64> {
    if !columns.is_empty() && target > 1 {
        return Err(CncError::NonBinaryTarget {
            id: id.to_string(),
            target,
        });
    }
    let mut bits = Vec::with_capacity(raw_attributes.len());
    for (column, value) in columns.iter().zip(raw_attributes) {
        match value {
            Some(v @ (0 | 1)) => bits.push(Some(*v as u8)),
            Some(v) => {
                return Err(CncError::InvalidSubgroupAttribute {
                    id: id.to_string(),
                    column: column.clone(),
                    value: *v,
                })
            }
            None => bits.push(None),
        }
    }
    Ok(encode_group_id(target, &bits))
}

/// Human-readable group names in group-id order.
///
/// E.g. target `pmx` with subgroup `tube` gives
/// `without_pmx_without_tube`, `with_pmx_without_tube`,
/// `without_pmx_with_tube`, `with_pmx_with_tube`.
pub fn group_names(target_column: &str, subgroup_columns: &[String]) -> Vec<String> {
    let presence = |on: bool| if on { "with" } else { "without" };
    let n_groups = 1_usize << (subgroup_columns.len() + 1);
    (0..n_groups)
        .map(|g| {
            let mut name = format!("{}_{target_column}", presence(g % 2 != 0));
            for (ndx, column) in subgroup_columns.iter().enumerate() {
                let on = (g >> (ndx + 1)) % 2 != 0;
                name.push_str(&format!("_{}_{column}", presence(on)));
            }
            name
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single_subgroup() {
        assert_eq!(encode_group_id(0, &[Some(0)]), 0);
        assert_eq!(encode_group_id(1, &[Some(0)]), 1);
        assert_eq!(encode_group_id(0, &[Some(1)]), 2);
        assert_eq!(encode_group_id(1, &[Some(1)]), 3);
    }

    #[test]
    fn test_encode_no_subgroups_is_target() {
        assert_eq!(encode_group_id(1, &[]), 1);
        assert_eq!(encode_group_id(0, &[]), 0);
    }

    #[test]
    fn test_missing_attribute_is_unlabeled_not_zero() {
        assert_eq!(encode_group_id(0, &[None]), UNLABELED_GROUP);
        assert_eq!(encode_group_id(1, &[Some(1), None]), UNLABELED_GROUP);
    }

    #[test]
    fn test_decode_recovers_inputs() {
        for num_subgroups in 0..4 {
            for target in 0..2u32 {
                for mask in 0..(1u32 << num_subgroups) {
                    let bits: Vec<u8> = (0..num_subgroups).map(|i| ((mask >> i) & 1) as u8).collect();
                    let attrs: Vec<Option<u8>> = bits.iter().map(|b| Some(*b)).collect();
                    let g = encode_group_id(target, &attrs);
                    assert!(g >= 0);
                    assert_eq!(decode_group_id(g, num_subgroups), Some((target, bits)));
                }
            }
        }
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        assert_eq!(decode_group_id(-1, 1), None);
        assert_eq!(decode_group_id(4, 1), None);
    }

    #[test]
    fn test_group_id_for_validates_attributes() {
        let cols = vec!["tube".to_string()];
        assert_eq!(group_id_for("a", 1, &cols, &[Some(1)]).unwrap(), 3);
        assert_eq!(group_id_for("a", 1, &cols, &[None]).unwrap(), UNLABELED_GROUP);
        assert!(matches!(
            group_id_for("a", 1, &cols, &[Some(2)]),
            Err(CncError::InvalidSubgroupAttribute { value: 2, .. })
        ));
        assert!(matches!(
            group_id_for("a", 3, &cols, &[Some(0)]),
            Err(CncError::NonBinaryTarget { target: 3, .. })
        ));
        // Multi-class targets are fine without subgroup columns
        assert_eq!(group_id_for("a", 3, &[], &[]).unwrap(), 3);
    }

    #[test]
    fn test_group_names() {
        let names = group_names("pmx", &["tube".to_string()]);
        assert_eq!(
            names,
            vec![
                "without_pmx_without_tube",
                "with_pmx_without_tube",
                "without_pmx_with_tube",
                "with_pmx_with_tube",
            ]
        );
        assert_eq!(group_names("y", &[]), vec!["without_y", "with_y"]);
    }

    #[test]
    fn test_split_names() {
        assert_eq!(Split::from_name("valid"), Some(Split::Valid));
        assert_eq!(Split::from_name("holdout"), None);
        assert_eq!(Split::Train.to_string(), "train");
    }
}
