use crate::backend::optimizer::PassError;
use crate::backend::ptir_utils::tensor_spec_static;
use crate::backend::shape_inference::infer_gather;
use crate::backend::spec::{
    format_value_type, DType, GatherDimensionNumbers, GatherSpec, TensorSpec, ValueId, ValueType,
};

/// Largest number of index vectors a lowered gather may iterate over (32-bit loop counter).
pub const MAX_GATHER_INDICES: u64 = i32::MAX as u64;

/// Validated view of one gather instruction with every derived quantity precomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherDescriptor {
    pub value: ValueId,
    pub dtype: DType,
    pub index_dtype: DType,
    pub operand_dims: Vec<usize>,
    pub indices_dims: Vec<usize>,
    pub dimension_numbers: GatherDimensionNumbers,
    pub slice_sizes: Vec<usize>,
    /// Number of components in one index vector (1 when the vector is implicit).
    pub index_len: usize,
    /// Indices shape with the index vector dimension removed.
    pub batch_dims: Vec<usize>,
    pub trip_count: usize,
    /// `slice_sizes` without the collapsed dims.
    pub window_dims: Vec<usize>,
    pub output_dims: Vec<usize>,
}

impl GatherDescriptor {
    /// Validates a gather from its operand types and attributes.
    ///
    /// The declared `output` must match the inferred gather output exactly.
    pub fn new(
        value: ValueId,
        operand: &ValueType,
        indices: &ValueType,
        spec: &GatherSpec,
        output: &ValueType,
    ) -> Result<Self, PassError> {
        let malformed = |reason: String| PassError::MalformedDescriptor { value, reason };
        let operand = operand
            .as_tensor()
            .ok_or_else(|| malformed("operand is not a tensor".into()))?;
        let indices = indices
            .as_tensor()
            .ok_or_else(|| malformed("indices are not a tensor".into()))?;
        let inferred = infer_gather(operand, indices, spec).map_err(|err| malformed(err.to_string()))?;

        // Both shapes are static once inference succeeded.
        let operand_dims = static_dims(operand).ok_or_else(|| malformed("dynamic operand".into()))?;
        let indices_dims = static_dims(indices).ok_or_else(|| malformed("dynamic indices".into()))?;
        let output_dims = static_dims(&inferred).ok_or_else(|| malformed("dynamic output".into()))?;

        let dnums = &spec.dimension_numbers;
        let implicit = dnums.index_vector_dim == indices_dims.len();
        let index_len = if implicit {
            1
        } else {
            indices_dims[dnums.index_vector_dim]
        };
        let batch_dims = indices_dims
            .iter()
            .enumerate()
            .filter(|(axis, _)| *axis != dnums.index_vector_dim)
            .map(|(_, dim)| *dim)
            .collect::<Vec<_>>();

        let wide_trip = batch_dims
            .iter()
            .fold(1u128, |acc, dim| acc.saturating_mul(*dim as u128));
        if wide_trip > u128::from(MAX_GATHER_INDICES) {
            return Err(PassError::UnsupportedSize {
                limit: MAX_GATHER_INDICES,
                actual: wide_trip,
            });
        }

        let declared = ValueType::Tensor(inferred.clone());
        if *output != declared {
            return Err(malformed(format!(
                "declared output {} does not match inferred {}",
                format_value_type(output),
                format_value_type(&declared)
            )));
        }

        let window_dims = spec
            .slice_sizes
            .iter()
            .enumerate()
            .filter(|(dim, _)| !dnums.collapsed_slice_dims.contains(dim))
            .map(|(_, size)| *size)
            .collect();

        Ok(Self {
            value,
            dtype: operand.dtype,
            index_dtype: indices.dtype,
            operand_dims,
            indices_dims,
            dimension_numbers: dnums.clone(),
            slice_sizes: spec.slice_sizes.clone(),
            index_len,
            batch_dims,
            trip_count: wide_trip as usize,
            window_dims,
            output_dims,
        })
    }

    pub fn operand_rank(&self) -> usize {
        self.operand_dims.len()
    }

    pub fn output_rank(&self) -> usize {
        self.output_dims.len()
    }

    pub fn output_spec(&self) -> TensorSpec {
        tensor_spec_static(self.dtype, &self.output_dims)
    }

    pub fn output_element_count(&self) -> u128 {
        self.output_dims
            .iter()
            .fold(1u128, |acc, dim| acc.saturating_mul(*dim as u128))
    }

    /// Returns `true` when the index vector is implicit (one component per batch coordinate).
    pub fn has_implicit_index_vector(&self) -> bool {
        self.dimension_numbers.index_vector_dim == self.indices_dims.len()
    }

    /// Index-vector component that feeds operand dimension `dim`, if any.
    pub fn start_component(&self, dim: usize) -> Option<usize> {
        self.dimension_numbers
            .start_index_map
            .iter()
            .position(|mapped| *mapped == dim)
    }

    pub fn is_indexed(&self, dim: usize) -> bool {
        self.start_component(dim).is_some()
    }

    pub fn is_collapsed(&self, dim: usize) -> bool {
        self.dimension_numbers.collapsed_slice_dims.contains(&dim)
    }

    /// Operand dims that are neither indexed nor collapsed: read in full at offset zero.
    pub fn kept_dims(&self) -> Vec<usize> {
        (0..self.operand_rank())
            .filter(|dim| !self.is_indexed(*dim) && !self.is_collapsed(*dim))
            .collect()
    }

    /// Returns `true` when index component `k` addresses operand dim `k` for every dim.
    pub fn start_index_map_is_identity(&self) -> bool {
        let map = &self.dimension_numbers.start_index_map;
        map.len() == self.operand_rank() && map.iter().enumerate().all(|(k, dim)| k == *dim)
    }

    /// Output-rank shape holding the window at the offset positions and 1 at batch positions.
    pub fn window_in_output_rank(&self) -> Vec<usize> {
        let mut window = self.window_dims.iter();
        (0..self.output_rank())
            .map(|position| {
                if self.dimension_numbers.offset_dims.contains(&position) {
                    window.next().copied().unwrap_or(1)
                } else {
                    1
                }
            })
            .collect()
    }

    /// Permutation taking a `[*batch, *window]` tensor to the output dimension order.
    pub fn batch_window_to_output_perm(&self) -> Vec<usize> {
        let batch_rank = self.batch_dims.len();
        let mut next_batch = 0;
        (0..self.output_rank())
            .map(|position| {
                match self
                    .dimension_numbers
                    .offset_dims
                    .iter()
                    .position(|dim| *dim == position)
                {
                    Some(window_axis) => batch_rank + window_axis,
                    None => {
                        next_batch += 1;
                        next_batch - 1
                    }
                }
            })
            .collect()
    }
}

fn static_dims(spec: &TensorSpec) -> Option<Vec<usize>> {
    spec.shape.static_dims()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ptir_utils::value_type_static;

    fn gather_spec(
        offset_dims: &[usize],
        collapsed: &[usize],
        start_index_map: &[usize],
        index_vector_dim: usize,
        slice_sizes: &[usize],
    ) -> GatherSpec {
        GatherSpec {
            dimension_numbers: GatherDimensionNumbers {
                offset_dims: offset_dims.to_vec(),
                collapsed_slice_dims: collapsed.to_vec(),
                start_index_map: start_index_map.to_vec(),
                index_vector_dim,
            },
            slice_sizes: slice_sizes.to_vec(),
        }
    }

    #[test]
    fn derives_batch_window_and_trip_count() {
        let spec = gather_spec(&[1], &[0], &[0], 2, &[1, 3]);
        let desc = GatherDescriptor::new(
            ValueId(7),
            &value_type_static(DType::F32, &[1, 3]),
            &value_type_static(DType::Si32, &[7, 5]),
            &spec,
            &value_type_static(DType::F32, &[7, 3, 5]),
        )
        .expect("valid gather");

        assert!(desc.has_implicit_index_vector());
        assert_eq!(desc.index_len, 1);
        assert_eq!(desc.batch_dims, vec![7, 5]);
        assert_eq!(desc.trip_count, 35);
        assert_eq!(desc.window_dims, vec![3]);
        assert_eq!(desc.window_in_output_rank(), vec![1, 3, 1]);
        assert_eq!(desc.batch_window_to_output_perm(), vec![0, 2, 1]);
        assert!(desc.kept_dims() == vec![1]);
    }

    #[test]
    fn rejects_declared_output_mismatch() {
        let spec = gather_spec(&[0], &[1], &[1], 1, &[3, 1]);
        let err = GatherDescriptor::new(
            ValueId(2),
            &value_type_static(DType::F32, &[3, 3]),
            &value_type_static(DType::Si32, &[2]),
            &spec,
            &value_type_static(DType::F32, &[2, 3]),
        )
        .expect_err("output order is [3, 2]");
        assert!(matches!(err, PassError::MalformedDescriptor { .. }));
    }

    #[test]
    fn trip_count_bound_is_inclusive() {
        let spec = gather_spec(&[1], &[0], &[0], 1, &[1, 4]);
        let desc = GatherDescriptor::new(
            ValueId(0),
            &value_type_static(DType::F32, &[8, 4]),
            &value_type_static(DType::Si64, &[2147483647]),
            &spec,
            &value_type_static(DType::F32, &[2147483647, 4]),
        )
        .expect("exactly at the bound");
        assert_eq!(desc.trip_count as u64, MAX_GATHER_INDICES);
    }
}
