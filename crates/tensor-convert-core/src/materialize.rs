//! Copy strided tensor views into self-contained row-major buffers.

use safetensors::tensor::TensorView;
use safetensors::SafeTensorError;

use crate::error::{ConvertError, ConvertResult};
use crate::tensor::{DType, TensorBundle, TensorHandle};

/// Tensor with owned, row-major data, ready to be serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContiguousTensor {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl ContiguousTensor {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Borrow as a safetensors view for serialization.
    ///
    /// Fails if the byte length does not match shape and dtype.
    pub fn view(&self) -> Result<TensorView<'_>, SafeTensorError> {
        TensorView::new(self.dtype.to_safetensors(), self.shape.clone(), &self.data)
    }
}

/// Produce a contiguous copy of `handle`.
///
/// Already-contiguous views are copied with a single slice copy; anything
/// else is gathered element by element following the strides.
///
/// # Errors
///
/// Returns `ConvertError::MaterializeFailed` if:
/// - shape and strides have different ranks
/// - the layout arithmetic overflows
/// - the view reaches past the end of its storage
pub fn materialize(handle: &TensorHandle) -> ConvertResult<ContiguousTensor> {
    let fail = |reason: String| {
        tracing::error!("[CNV-E006] Cannot materialize '{}': {}", handle.name(), reason);
        ConvertError::MaterializeFailed {
            name: handle.name().to_string(),
            reason,
        }
    };

    let shape = handle.shape();
    let strides = handle.strides();
    if shape.len() != strides.len() {
        return Err(fail(format!(
            "rank mismatch: shape {:?} has {} axes, strides {:?} has {}",
            shape,
            shape.len(),
            strides,
            strides.len()
        )));
    }

    let elem_size = handle.dtype().size_in_bytes();
    let num_elements = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| fail(format!("element count overflows for shape {:?}", shape)))?;

    if num_elements == 0 {
        return Ok(ContiguousTensor::new(
            handle.name(),
            handle.dtype(),
            shape.to_vec(),
            Vec::new(),
        ));
    }

    // Largest element index the view touches.
    let last_element = shape
        .iter()
        .zip(strides)
        .try_fold(handle.offset(), |acc, (&dim, &stride)| {
            (dim - 1).checked_mul(stride).and_then(|span| acc.checked_add(span))
        })
        .ok_or_else(|| fail("stride arithmetic overflows".to_string()))?;

    let required = last_element
        .checked_add(1)
        .and_then(|n| n.checked_mul(elem_size))
        .ok_or_else(|| fail("byte extent overflows".to_string()))?;

    let storage = handle.storage().bytes();
    if required > storage.len() {
        return Err(fail(format!(
            "view needs {} bytes but storage '{}' holds {}",
            required,
            handle.storage().key(),
            storage.len()
        )));
    }

    let data = if handle.is_contiguous() {
        let start = handle.offset() * elem_size;
        storage[start..start + num_elements * elem_size].to_vec()
    } else {
        gather_strided(storage, shape, strides, handle.offset(), elem_size, num_elements)
    };

    Ok(ContiguousTensor::new(
        handle.name(),
        handle.dtype(),
        shape.to_vec(),
        data,
    ))
}

/// Materialize every tensor of `bundle`, in bundle order.
///
/// Stops at the first tensor that cannot be materialized.
pub fn materialize_all(bundle: &TensorBundle) -> ConvertResult<Vec<ContiguousTensor>> {
    let tensors = bundle.iter().map(materialize).collect::<ConvertResult<Vec<_>>>()?;
    let copied = bundle.iter().filter(|h| !h.is_contiguous()).count();
    if copied > 0 {
        tracing::debug!("Gathered {} non-contiguous tensors", copied);
    }
    Ok(tensors)
}

/// Walk the view in row-major order with an odometer over the axes.
fn gather_strided(
    storage: &[u8],
    shape: &[usize],
    strides: &[usize],
    offset: usize,
    elem_size: usize,
    num_elements: usize,
) -> Vec<u8> {
    let rank = shape.len();
    let mut index = vec![0usize; rank];
    let mut out = Vec::with_capacity(num_elements * elem_size);

    for _ in 0..num_elements {
        let element = offset
            + index
                .iter()
                .zip(strides)
                .map(|(&i, &stride)| i * stride)
                .sum::<usize>();
        let start = element * elem_size;
        out.extend_from_slice(&storage[start..start + elem_size]);

        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Storage;

    fn f32_storage(key: &str, values: &[f32]) -> Storage {
        Storage::new(key, bytemuck::cast_slice::<f32, u8>(values).to_vec())
    }

    fn as_f32(t: &ContiguousTensor) -> Vec<f32> {
        t.data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_contiguous_with_offset_is_sliced() {
        let storage = f32_storage("s0", &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let handle = TensorHandle::new("t", DType::F32, vec![2, 2], vec![2, 1], 2, storage);

        let out = materialize(&handle).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(as_f32(&out), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_transpose_is_gathered_row_major() {
        // [[0, 1, 2], [3, 4, 5]] viewed transposed -> [[0, 3], [1, 4], [2, 5]]
        let storage = f32_storage("s0", &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let handle = TensorHandle::new("t", DType::F32, vec![3, 2], vec![1, 3], 0, storage);

        let out = materialize(&handle).unwrap();
        assert_eq!(as_f32(&out), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_column_slice_is_gathered() {
        // Column 1 of a 3x3 matrix.
        let values: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let handle =
            TensorHandle::new("col", DType::F32, vec![3], vec![3], 1, f32_storage("s0", &values));

        assert_eq!(as_f32(&materialize(&handle).unwrap()), vec![1.0, 4.0, 7.0]);
    }

    #[test]
    fn test_broadcast_zero_stride() {
        let handle = TensorHandle::new(
            "b",
            DType::F32,
            vec![2, 3],
            vec![0, 1],
            0,
            f32_storage("s0", &[7.0, 8.0, 9.0]),
        );
        assert_eq!(
            as_f32(&materialize(&handle).unwrap()),
            vec![7.0, 8.0, 9.0, 7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn test_scalar_and_empty() {
        let scalar = TensorHandle::new("s", DType::F32, vec![], vec![], 1, f32_storage("s0", &[1.0, 2.0]));
        let out = materialize(&scalar).unwrap();
        assert!(out.shape().is_empty());
        assert_eq!(as_f32(&out), vec![2.0]);

        let empty = TensorHandle::contiguous("e", DType::F32, vec![0, 4], Storage::new("s1", Vec::new()));
        assert!(materialize(&empty).unwrap().data().is_empty());
    }

    #[test]
    fn test_out_of_bounds_view_fails() {
        let handle = TensorHandle::new(
            "oob",
            DType::F32,
            vec![4],
            vec![1],
            2,
            f32_storage("s0", &[0.0; 4]),
        );
        let err = materialize(&handle).unwrap_err();
        assert!(matches!(err, ConvertError::MaterializeFailed { ref name, .. } if name == "oob"));
    }

    #[test]
    fn test_rank_mismatch_fails() {
        let handle = TensorHandle::new("r", DType::F32, vec![2, 2], vec![1], 0, f32_storage("s0", &[0.0; 4]));
        assert!(matches!(
            materialize(&handle),
            Err(ConvertError::MaterializeFailed { .. })
        ));
    }

    #[test]
    fn test_materialize_all_stops_at_first_failure() {
        let good = TensorHandle::contiguous("good", DType::F32, vec![1], f32_storage("s0", &[1.0]));
        let bad = TensorHandle::new("bad", DType::F32, vec![8], vec![1], 0, f32_storage("s1", &[1.0]));
        let bundle: TensorBundle = [good, bad].into_iter().collect();

        match materialize_all(&bundle) {
            Err(ConvertError::MaterializeFailed { name, .. }) => assert_eq!(name, "bad"),
            other => panic!("expected MaterializeFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_view_round_trips_dtype_and_shape() {
        let t = ContiguousTensor::new("w", DType::BF16, vec![2], vec![0, 1, 2, 3]);
        let view = t.view().unwrap();
        assert_eq!(view.dtype(), safetensors::Dtype::BF16);
        assert_eq!(view.shape(), &[2]);

        let bad = ContiguousTensor::new("w", DType::F32, vec![2], vec![0, 1]);
        assert!(bad.view().is_err());
    }
}
