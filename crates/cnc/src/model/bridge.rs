//! Tensor bridge: materialise dataset rows as burn tensors and pull values
//! back out for logging and scoring.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::data::Dataset;
use crate::error::{CncError, Result};

/// Stack the inputs of `indices` into a `(len, d_input)` tensor.
///
/// # Errors
/// Fails on an empty index set or inconsistent row lengths.
pub fn inputs_to_tensor<B: Backend>(
    dataset: &Dataset,
    indices: &[usize],
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    let rows: Vec<&[f32]> = indices
        .iter()
        .map(|&i| {
            dataset
                .get(i)
                .map(|e| e.input.as_slice())
                .ok_or_else(|| CncError::Shape(format!("index {i} out of range for {}", dataset.len())))
        })
        .collect::<Result<_>>()?;
    rows_to_tensor(&rows, device)
}

/// Convert equally sized rows to a burn 2D tensor.
pub fn rows_to_tensor<B: Backend>(rows: &[&[f32]], device: &B::Device) -> Result<Tensor<B, 2>> {
    let Some(first) = rows.first() else {
        return Err(CncError::Shape("cannot build a tensor from zero rows".into()));
    };
    let dim = first.len();
    if dim == 0 {
        return Err(CncError::Shape("row dimension must be > 0".into()));
    }
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != dim) {
        return Err(CncError::Shape(format!(
            "row {i} has length {}, expected {dim}",
            row.len()
        )));
    }
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Ok(Tensor::from_data(TensorData::new(flat, [rows.len(), dim]), device))
}

/// Class labels as an integer tensor.
pub fn targets_to_tensor<B: Backend>(targets: &[u32], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = targets.iter().map(|&t| t as i64).collect();
    Tensor::from_data(TensorData::new(values, [targets.len()]), device)
}

/// Extract rows of a 2D tensor.
pub fn tensor_to_rows<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<Vec<f32>>> {
    let [_, cols] = tensor.dims();
    let flat = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| CncError::Shape(format!("{e:?}")))?;
    Ok(flat.chunks(cols.max(1)).map(|c| c.to_vec()).collect())
}

/// Extract f64 values from a 1D tensor.
pub fn tensor_to_vec<B: Backend>(tensor: Tensor<B, 1>) -> Result<Vec<f64>> {
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| CncError::Shape(format!("{e:?}")))?;
    Ok(values.into_iter().map(|v| v as f64).collect())
}

/// Extract a single f64 scalar.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Example, Split};
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn dataset() -> Dataset {
        Dataset::new(vec![
            Example {
                id: "a".into(),
                input: vec![1.0, 2.0, 3.0],
                target: 0,
                group_id: 0,
                gaze_features: Some(vec![0.5, 0.5]),
                split: Split::Train,
            },
            Example {
                id: "b".into(),
                input: vec![4.0, 5.0, 6.0],
                target: 1,
                group_id: 3,
                gaze_features: None,
                split: Split::Train,
            },
        ])
    }

    #[test]
    fn test_inputs_round_trip() {
        let device = Default::default();
        let ds = dataset();
        let tensor = inputs_to_tensor::<TestBackend>(&ds, &[1, 0], &device).unwrap();
        assert_eq!(tensor.dims(), [2, 3]);
        let rows = tensor_to_rows(tensor).unwrap();
        assert_eq!(rows, vec![vec![4.0, 5.0, 6.0], vec![1.0, 2.0, 3.0]]);
    }

    #[test]
    fn test_empty_and_ragged_rows() {
        let device = Default::default();
        assert!(rows_to_tensor::<TestBackend>(&[], &device).is_err());
        let a = [1.0_f32, 2.0];
        let b = [1.0_f32];
        assert!(rows_to_tensor::<TestBackend>(&[&a, &b], &device).is_err());
    }

    #[test]
    fn test_targets_and_scalars() {
        let device = Default::default();
        let targets = targets_to_tensor::<TestBackend>(&[0, 1, 1], &device);
        assert_eq!(targets.dims(), [3]);
        let t = Tensor::<TestBackend, 1>::from_data(TensorData::from([1.0_f32, 2.5]), &device);
        let values = tensor_to_vec(t).unwrap();
        assert!((values[1] - 2.5).abs() < 1e-6);
        let s = Tensor::<TestBackend, 1>::from_data(TensorData::from([42.0_f32]), &device);
        assert!((tensor_to_f64(s) - 42.0).abs() < 1e-6);
    }
}
