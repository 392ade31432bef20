use crate::backend::builder::GraphBuilder;
use crate::backend::ptir_utils::tensor_literal_zeros;
use crate::backend::shape_inference::ShapeError;
use crate::backend::spec::Operand;

use super::descriptor::GatherDescriptor;
use super::emit::{operand_start_vector, reshape_to, Expansion};

/// Lowers a gather with a single index vector to one `dynamic_slice`.
pub(super) fn expand_slice(
    builder: &mut GraphBuilder,
    operand: Operand,
    indices: Operand,
    desc: &GatherDescriptor,
) -> Result<Expansion, ShapeError> {
    let index_vector = reshape_to(builder, indices, &desc.indices_dims, &[desc.index_len])?;
    let starts = operand_start_vector(builder, index_vector, desc)?;
    let window = builder.dynamic_slice(operand, starts, &desc.slice_sizes)?;
    // Batch dims are all 1 here, so dropping collapsed dims and placing the window is a reshape.
    let root = reshape_to(
        builder,
        Operand::Value(window),
        &desc.slice_sizes,
        &desc.output_dims,
    )?;
    Ok(Expansion::rooted_at(root))
}

/// Replaces a gather with no output elements by an empty constant.
pub(super) fn expand_empty(
    builder: &mut GraphBuilder,
    desc: &GatherDescriptor,
) -> Result<Expansion, ShapeError> {
    let literal = tensor_literal_zeros(desc.output_spec()).ok_or_else(|| ShapeError::Invalid {
        op: "constant",
        detail: "empty gather output must have a static shape".to_string(),
    })?;
    let root = builder.constant(literal)?;
    Ok(Expansion::rooted_at(root))
}
