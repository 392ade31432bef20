//! Instruction sequences shared by the gather lowerings.

use crate::backend::builder::GraphBuilder;
use crate::backend::ptir_utils::int_literal;
use crate::backend::shape_helpers::is_identity_permutation;
use crate::backend::shape_inference::ShapeError;
use crate::backend::spec::{Operand, ValueId};

use super::descriptor::GatherDescriptor;

/// Root of a staged replacement and the instruction that inherits the gather's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Expansion {
    pub root: ValueId,
    pub metadata_target: ValueId,
}

impl Expansion {
    pub fn rooted_at(root: ValueId) -> Self {
        Self {
            root,
            metadata_target: root,
        }
    }
}

/// Reshapes `input` to `dims` unless it already is a plain value of that shape.
pub(super) fn reshape_to(
    builder: &mut GraphBuilder,
    input: Operand,
    from: &[usize],
    dims: &[usize],
) -> Result<ValueId, ShapeError> {
    match input {
        Operand::Value(value) if from == dims => Ok(value),
        other => builder.reshape(other, dims),
    }
}

/// Reorders the axes of `input` (shaped `dims`) by `perm`.
///
/// Identity permutations of plain values emit nothing; a permutation that only moves extent-1
/// axes is a reshape.
pub(super) fn permute(
    builder: &mut GraphBuilder,
    input: Operand,
    dims: &[usize],
    perm: &[usize],
) -> Result<ValueId, ShapeError> {
    if is_identity_permutation(perm) {
        return reshape_to(builder, input, dims, dims);
    }
    let moved_non_unit = perm
        .iter()
        .copied()
        .filter(|axis| dims[*axis] != 1)
        .collect::<Vec<_>>();
    if moved_non_unit.windows(2).all(|pair| pair[0] < pair[1]) {
        let permuted = perm.iter().map(|axis| dims[*axis]).collect::<Vec<_>>();
        return builder.reshape(input, &permuted);
    }
    builder.transpose(input, perm)
}

/// Builds the operand start vector from one index vector of shape `[index_len]`.
///
/// Component `k` lands at operand dim `start_index_map[k]`; every other dim starts at zero.
pub(super) fn operand_start_vector(
    builder: &mut GraphBuilder,
    index_vector: ValueId,
    desc: &GatherDescriptor,
) -> Result<ValueId, ShapeError> {
    if desc.start_index_map_is_identity() {
        return Ok(index_vector);
    }

    let mut zero = None;
    let mut parts = Vec::with_capacity(desc.operand_rank());
    for dim in 0..desc.operand_rank() {
        let part = match desc.start_component(dim) {
            Some(_) if desc.index_len == 1 => index_vector,
            Some(component) => builder.slice(index_vector, &[component], &[1])?,
            None => match zero {
                Some(zero) => zero,
                None => {
                    let value = builder.constant(int_literal(desc.index_dtype, &[1], &[0]))?;
                    zero = Some(value);
                    value
                }
            },
        };
        parts.push(part);
    }
    match parts.as_slice() {
        [single] => Ok(*single),
        _ => builder.concat(&parts, 0),
    }
}
