use crate::backend::builder::GraphBuilder;
use crate::backend::shape_inference::ShapeError;
use crate::backend::spec::Operand;

use super::descriptor::GatherDescriptor;
use super::emit::{reshape_to, Expansion};

/// Lowers a gather whose indexed operand dims all have extent 1.
///
/// Every index vector is clamped to the same start, so the result is one window at offset zero
/// broadcast across the batch positions. The indices are not read.
pub(super) fn expand_broadcast(
    builder: &mut GraphBuilder,
    operand: Operand,
    desc: &GatherDescriptor,
) -> Result<Expansion, ShapeError> {
    let zeros = vec![0; desc.operand_rank()];
    let window = builder.slice(operand, &zeros, &desc.slice_sizes)?;
    let placed = desc.window_in_output_rank();
    let shaped = reshape_to(builder, Operand::Value(window), &desc.slice_sizes, &placed)?;
    let root = if placed == desc.output_dims {
        shaped
    } else {
        builder.broadcast_to(shaped, &desc.output_dims)?
    };
    Ok(Expansion::rooted_at(root))
}
