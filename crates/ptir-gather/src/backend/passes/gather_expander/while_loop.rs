//! Counted-loop lowering for gathers with more than one index vector.
//!
//! The loop carries `(counter, operand, indices, accumulator)` in that order. Iteration `i` reads
//! row `i` of the flattened indices, slices the operand window it addresses and writes that window
//! into row `i` of the accumulator. Afterwards the accumulator's leading dim is split back into
//! the batch shape and the axes are permuted into the output order.
//!
//! Carried shapes never gain extent-1 dims beyond those already in the operand or indices: the
//! counter is a scalar, the indices are folded to `[trip]` or `[trip, index_len]`, and the
//! accumulator is `[trip, *window]`.

use crate::backend::builder::GraphBuilder;
use crate::backend::optimizer::PassContext;
use crate::backend::ptir_utils::{
    int_literal, scalar_literal_si32, scalar_literal_zero, value_type_static,
};
use crate::backend::shape_inference::ShapeError;
use crate::backend::spec::{ComparisonOp, DType, Operand, Region, ValueId, ValueType};

use super::descriptor::GatherDescriptor;
use super::emit::{operand_start_vector, permute, reshape_to, Expansion};

/// Position of the accumulator in the carried tuple.
const ACCUMULATOR_SLOT: usize = 3;

/// Emits the loop and its pre/post-processing into `builder`; new regions land in `regions`.
pub(super) fn expand_loop(
    builder: &mut GraphBuilder,
    operand: Operand,
    indices: Operand,
    desc: &GatherDescriptor,
    cx: &mut PassContext,
    regions: &mut Vec<Region>,
) -> Result<Expansion, ShapeError> {
    let trip = desc.trip_count;
    let trip_si32 = i32::try_from(trip).map_err(|_| ShapeError::Invalid {
        op: "while",
        detail: format!("trip count {trip} does not fit the si32 loop counter"),
    })?;

    let (matrix, matrix_dims) = flatten_indices(builder, indices, desc)?;

    let mut acc_dims = Vec::with_capacity(desc.window_dims.len() + 1);
    acc_dims.push(trip);
    acc_dims.extend_from_slice(&desc.window_dims);

    let counter = builder.constant(scalar_literal_si32(0))?;
    let zero = builder.constant(scalar_literal_zero(desc.dtype))?;
    let acc = builder.broadcast_to(zero, &acc_dims)?;

    let carried = [
        value_type_static(DType::Si32, &[]),
        value_type_static(desc.dtype, &desc.operand_dims),
        value_type_static(desc.index_dtype, &matrix_dims),
        value_type_static(desc.dtype, &acc_dims),
    ];

    let cond = build_cond(cx, &carried, trip_si32)?;
    let body = build_body(cx, &carried, desc, &acc_dims)?;
    let while_value = builder.while_loop(
        vec![counter.into(), operand, matrix.into(), acc.into()],
        &cond,
        &body,
    )?;
    regions.push(cond);
    regions.push(body);

    let gathered = Operand::TupleElement {
        tuple: while_value,
        index: ACCUMULATOR_SLOT,
    };
    let mut batched_dims = desc.batch_dims.clone();
    batched_dims.extend_from_slice(&desc.window_dims);
    let batched = if batched_dims == acc_dims {
        gathered
    } else {
        Operand::Value(builder.reshape(gathered, &batched_dims)?)
    };
    let root = permute(
        builder,
        batched,
        &batched_dims,
        &desc.batch_window_to_output_perm(),
    )?;

    Ok(Expansion {
        root,
        metadata_target: while_value,
    })
}

/// Folds the indices into `[trip]` (implicit index vector) or `[trip, index_len]`.
fn flatten_indices(
    builder: &mut GraphBuilder,
    indices: Operand,
    desc: &GatherDescriptor,
) -> Result<(ValueId, Vec<usize>), ShapeError> {
    if desc.has_implicit_index_vector() {
        let dims = vec![desc.trip_count];
        let matrix = reshape_to(builder, indices, &desc.indices_dims, &dims)?;
        return Ok((matrix, dims));
    }

    let ivd = desc.dimension_numbers.index_vector_dim;
    let rank = desc.indices_dims.len();
    let perm = (0..rank)
        .filter(|axis| *axis != ivd)
        .chain(std::iter::once(ivd))
        .collect::<Vec<_>>();
    let permuted_dims = perm
        .iter()
        .map(|axis| desc.indices_dims[*axis])
        .collect::<Vec<_>>();
    let dims = vec![desc.trip_count, desc.index_len];
    let matrix = if ivd + 1 == rank {
        reshape_to(builder, indices, &desc.indices_dims, &dims)?
    } else {
        let moved = permute(builder, indices, &desc.indices_dims, &perm)?;
        reshape_to(builder, Operand::Value(moved), &permuted_dims, &dims)?
    };
    Ok((matrix, dims))
}

fn add_carried_parameters(
    builder: &mut GraphBuilder,
    carried: &[ValueType; 4],
) -> [ValueId; 4] {
    carried.clone().map(|ty| builder.add_parameter(ty))
}

/// `counter < trip`
fn build_cond(
    cx: &mut PassContext,
    carried: &[ValueType; 4],
    trip: i32,
) -> Result<Region, ShapeError> {
    let mut cond = GraphBuilder::new();
    let [counter, _, _, _] = add_carried_parameters(&mut cond, carried);
    let limit = cond.constant(scalar_literal_si32(trip))?;
    let predicate = cond.compare(counter, limit, ComparisonOp::Less)?;
    cond.finish_region(cx.allocate_region_id(), vec![predicate])
}

fn build_body(
    cx: &mut PassContext,
    carried: &[ValueType; 4],
    desc: &GatherDescriptor,
    acc_dims: &[usize],
) -> Result<Region, ShapeError> {
    let mut body = GraphBuilder::new();
    let [counter, operand, matrix, acc] = add_carried_parameters(&mut body, carried);

    let row = body.reshape(counter, &[1])?;
    let index_vector = if desc.has_implicit_index_vector() {
        body.dynamic_slice(matrix, row, &[1])?
    } else {
        let column = body.constant(int_literal(DType::Si32, &[1], &[0]))?;
        let row_starts = body.concat(&[row, column], 0)?;
        let picked = body.dynamic_slice(matrix, row_starts, &[1, desc.index_len])?;
        body.reshape(picked, &[desc.index_len])?
    };

    let starts = operand_start_vector(&mut body, index_vector, desc)?;
    let window = body.dynamic_slice(operand, starts, &desc.slice_sizes)?;

    let mut update_dims = acc_dims.to_vec();
    update_dims[0] = 1;
    let update = body.reshape(window, &update_dims)?;
    let acc_starts = if desc.window_dims.is_empty() {
        row
    } else {
        let zeros = vec![0i64; desc.window_dims.len()];
        let tail = body.constant(int_literal(DType::Si32, &[zeros.len()], &zeros))?;
        body.concat(&[row, tail], 0)?
    };
    let next_acc = body.dynamic_update_slice(acc, update, acc_starts, &update_dims)?;

    let one = body.constant(scalar_literal_si32(1))?;
    let next_counter = body.add(counter, one)?;

    body.finish_region(
        cx.allocate_region_id(),
        vec![next_counter, operand, matrix, next_acc],
    )
}
