use std::sync::Arc;

use crate::backend::spec::{DType, Dimension, Shape, TensorLiteral, TensorSpec, ValueType};

/// Builds a static backend shape descriptor from explicit dimensions.
pub fn shape_static(dims: &[usize]) -> Shape {
    Shape::new(
        dims.iter()
            .copied()
            .map(Dimension::Static)
            .collect::<Vec<_>>(),
    )
}

/// Builds a tensor spec with fully static dimensions.
pub fn tensor_spec_static(dtype: DType, dims: &[usize]) -> TensorSpec {
    TensorSpec::new(dtype, shape_static(dims))
}

/// Shorthand for a static tensor value type.
pub fn value_type_static(dtype: DType, dims: &[usize]) -> ValueType {
    ValueType::Tensor(tensor_spec_static(dtype, dims))
}

/// Creates a zero-filled literal of the provided static spec.
///
/// Returns `None` when `spec` is dynamic or its byte length overflows.
pub fn tensor_literal_zeros(spec: TensorSpec) -> Option<TensorLiteral> {
    let byte_len = spec.byte_len()?;
    Some(TensorLiteral::new(
        spec,
        Arc::<[u8]>::from(vec![0u8; byte_len]),
    ))
}

/// Creates a rank-0 zero literal of `dtype`.
pub fn scalar_literal_zero(dtype: DType) -> TensorLiteral {
    TensorLiteral::new(
        tensor_spec_static(dtype, &[]),
        Arc::<[u8]>::from(vec![0u8; dtype.scalar_byte_len()]),
    )
}

/// Encodes integer values as a little-endian literal of the given integer dtype.
///
/// Values are truncated to the dtype width.
pub fn int_literal(dtype: DType, dims: &[usize], values: &[i64]) -> TensorLiteral {
    debug_assert!(dtype.is_integer());
    let width = dtype.scalar_byte_len();
    let mut bytes = Vec::with_capacity(values.len() * width);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes()[..width]);
    }
    TensorLiteral::new(tensor_spec_static(dtype, dims), Arc::<[u8]>::from(bytes))
}

/// Creates a rank-0 `si32` literal.
pub fn scalar_literal_si32(value: i32) -> TensorLiteral {
    int_literal(DType::Si32, &[], &[i64::from(value)])
}
