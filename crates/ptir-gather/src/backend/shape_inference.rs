//! Output typing for PTIR operations.
//!
//! Every builder call and the verifier go through [`infer_output`], so a rewrite that type-checks
//! here produces instructions whose recorded `output` matches what a backend will compute.

use thiserror::Error;

use crate::backend::shape_helpers::{
    checked_element_count_or_error, is_permutation, is_strictly_ascending, static_dims_or_error,
};
use crate::backend::spec::{
    BroadcastToSpec, DType, Dimension, GatherSpec, Operation, Program, Region, RegionId,
    ReshapeDim, ReshapeSpec, SliceSpec, TensorSpec, ValueId, ValueType,
};
use crate::backend::ptir_utils::tensor_spec_static;

/// Failure raised when an operation cannot be typed from its operands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("{op}: expected {expected} operands, got {actual}")]
    Arity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{op}: operand {index} must be a tensor")]
    NotTensor { op: &'static str, index: usize },
    #[error("{op}: dynamic dimension `?{symbol}` is not supported")]
    DynamicDimension { op: &'static str, symbol: String },
    #[error("{op}: operand %{} has no recorded type", value.0)]
    UnknownOperand { op: &'static str, value: ValueId },
    #[error("{op}: region ^r{region} is not defined")]
    MissingRegion { op: &'static str, region: usize },
    #[error("{op}: {detail}")]
    Invalid { op: &'static str, detail: String },
}

impl ShapeError {
    fn invalid(op: &'static str, detail: impl Into<String>) -> Self {
        ShapeError::Invalid {
            op,
            detail: detail.into(),
        }
    }
}

pub type ShapeResult<T> = Result<T, ShapeError>;

/// Resolves control-flow regions referenced by `while`.
pub trait RegionLookup {
    fn region(&self, id: RegionId) -> Option<&Region>;
}

impl RegionLookup for [Region] {
    fn region(&self, id: RegionId) -> Option<&Region> {
        self.iter().find(|region| region.id == id)
    }
}

impl RegionLookup for Vec<Region> {
    fn region(&self, id: RegionId) -> Option<&Region> {
        self.as_slice().region(id)
    }
}

impl RegionLookup for Program {
    fn region(&self, id: RegionId) -> Option<&Region> {
        Program::region(self, id)
    }
}

/// Infers the output type of `op` applied to operands of the given types.
pub fn infer_output<R: RegionLookup + ?Sized>(
    op: &Operation,
    operands: &[ValueType],
    regions: &R,
) -> ShapeResult<ValueType> {
    let name = op.name();
    let spec = match op {
        Operation::Constant(literal) => {
            expect_arity(name, operands, 0)?;
            let expected = literal
                .spec
                .byte_len()
                .ok_or_else(|| ShapeError::invalid(name, "constant must have a static shape"))?;
            if expected != literal.byte_len() {
                return Err(ShapeError::invalid(
                    name,
                    format!(
                        "literal holds {} bytes but its spec requires {expected}",
                        literal.byte_len()
                    ),
                ));
            }
            literal.spec.clone()
        }
        Operation::ElementwiseBinary(_) => {
            let [lhs, rhs] = tensors::<2>(name, operands)?;
            if lhs != rhs {
                return Err(ShapeError::invalid(name, "operands must share dtype and shape"));
            }
            lhs.clone()
        }
        Operation::Compare(_) => {
            let [lhs, rhs] = tensors::<2>(name, operands)?;
            if lhs != rhs {
                return Err(ShapeError::invalid(name, "operands must share dtype and shape"));
            }
            TensorSpec::new(DType::I1, lhs.shape.clone())
        }
        Operation::Reshape(spec) => {
            let [input] = tensors::<1>(name, operands)?;
            infer_reshape(input, spec)?
        }
        Operation::Transpose(spec) => {
            let [input] = tensors::<1>(name, operands)?;
            infer_transpose(input, &spec.perm)?
        }
        Operation::BroadcastTo(spec) => {
            let [input] = tensors::<1>(name, operands)?;
            infer_broadcast_to(input, spec)?
        }
        Operation::Slice(spec) => {
            let [input] = tensors::<1>(name, operands)?;
            infer_slice(input, spec)?
        }
        Operation::Concat(spec) => {
            let inputs = operands
                .iter()
                .enumerate()
                .map(|(index, ty)| {
                    ty.as_tensor()
                        .ok_or(ShapeError::NotTensor { op: name, index })
                })
                .collect::<ShapeResult<Vec<_>>>()?;
            infer_concat(&inputs, spec.axis)?
        }
        Operation::Gather(spec) => {
            let [operand, indices] = tensors::<2>(name, operands)?;
            infer_gather(operand, indices, spec)?
        }
        Operation::DynamicSlice(spec) => {
            let [input, starts] = tensors::<2>(name, operands)?;
            infer_dynamic_slice(input, starts, &spec.sizes)?
        }
        Operation::DynamicUpdateSlice(spec) => {
            let [base, update, starts] = tensors::<3>(name, operands)?;
            infer_dynamic_update_slice(base, update, starts, &spec.sizes)?
        }
        Operation::While(spec) => {
            return infer_while(operands, spec.cond_region, spec.body_region, regions);
        }
    };
    Ok(ValueType::Tensor(spec))
}

fn expect_arity(op: &'static str, operands: &[ValueType], expected: usize) -> ShapeResult<()> {
    if operands.len() != expected {
        return Err(ShapeError::Arity {
            op,
            expected,
            actual: operands.len(),
        });
    }
    Ok(())
}

fn tensors<'a, const N: usize>(
    op: &'static str,
    operands: &'a [ValueType],
) -> ShapeResult<[&'a TensorSpec; N]> {
    expect_arity(op, operands, N)?;
    let mut specs = Vec::with_capacity(N);
    for (index, ty) in operands.iter().enumerate() {
        specs.push(
            ty.as_tensor()
                .ok_or(ShapeError::NotTensor { op, index })?,
        );
    }
    specs
        .try_into()
        .map_err(|_| ShapeError::invalid(op, "operand arity mismatch"))
}

fn dims_of(op: &'static str, spec: &TensorSpec) -> ShapeResult<Vec<usize>> {
    static_dims_or_error(&spec.shape, |symbol| ShapeError::DynamicDimension {
        op,
        symbol: symbol.as_str().to_string(),
    })
}

fn element_count(op: &'static str, dims: &[usize]) -> ShapeResult<usize> {
    checked_element_count_or_error(dims, || ShapeError::invalid(op, "element count overflows"))
}

pub fn infer_reshape(input: &TensorSpec, spec: &ReshapeSpec) -> ShapeResult<TensorSpec> {
    const OP: &str = "reshape";
    let input_dims = dims_of(OP, input)?;
    let input_count = element_count(OP, &input_dims)?;

    let mut dims = Vec::with_capacity(spec.new_shape.len());
    let mut infer_axis = None;
    for (axis, dim) in spec.new_shape.iter().enumerate() {
        match dim {
            ReshapeDim::Explicit(Dimension::Static(value)) => dims.push(*value),
            ReshapeDim::Explicit(Dimension::Dynamic(symbol)) => {
                return Err(ShapeError::DynamicDimension {
                    op: OP,
                    symbol: symbol.as_str().to_string(),
                })
            }
            ReshapeDim::Infer => {
                if infer_axis.replace(axis).is_some() {
                    return Err(ShapeError::invalid(OP, "at most one inferred dimension"));
                }
                dims.push(1);
            }
        }
    }

    let known = element_count(OP, &dims)?;
    if let Some(axis) = infer_axis {
        if known == 0 || input_count % known != 0 {
            return Err(ShapeError::invalid(
                OP,
                format!("cannot infer dimension for {input_count} elements"),
            ));
        }
        dims[axis] = input_count / known;
    } else if known != input_count {
        return Err(ShapeError::invalid(
            OP,
            format!("{input_dims:?} and {dims:?} have different element counts"),
        ));
    }
    Ok(tensor_spec_static(input.dtype, &dims))
}

pub fn infer_transpose(input: &TensorSpec, perm: &[usize]) -> ShapeResult<TensorSpec> {
    const OP: &str = "transpose";
    let dims = dims_of(OP, input)?;
    if !is_permutation(perm, dims.len()) {
        return Err(ShapeError::invalid(
            OP,
            format!("{perm:?} is not a permutation of rank {}", dims.len()),
        ));
    }
    let out = perm.iter().map(|axis| dims[*axis]).collect::<Vec<_>>();
    Ok(tensor_spec_static(input.dtype, &out))
}

pub fn infer_broadcast_to(input: &TensorSpec, spec: &BroadcastToSpec) -> ShapeResult<TensorSpec> {
    const OP: &str = "broadcast_to";
    let from = dims_of(OP, input)?;
    let to = static_dims_or_error(&spec.result_shape, |symbol| ShapeError::DynamicDimension {
        op: OP,
        symbol: symbol.as_str().to_string(),
    })?;
    if from.len() > to.len() {
        return Err(ShapeError::invalid(
            OP,
            format!("cannot broadcast rank {} to rank {}", from.len(), to.len()),
        ));
    }
    let rank_diff = to.len() - from.len();
    for (axis, from_size) in from.iter().enumerate() {
        let to_size = to[axis + rank_diff];
        if *from_size != 1 && *from_size != to_size {
            return Err(ShapeError::invalid(
                OP,
                format!("{from:?} is not broadcast-compatible with {to:?}"),
            ));
        }
    }
    Ok(tensor_spec_static(input.dtype, &to))
}

pub fn infer_slice(input: &TensorSpec, spec: &SliceSpec) -> ShapeResult<TensorSpec> {
    const OP: &str = "slice";
    let dims = dims_of(OP, input)?;
    if spec.starts.len() != dims.len() || spec.sizes.len() != dims.len() {
        return Err(ShapeError::invalid(OP, "starts/sizes must match input rank"));
    }
    for (axis, dim) in dims.iter().enumerate() {
        let end = spec.starts[axis].checked_add(spec.sizes[axis]);
        if end.map_or(true, |end| end > *dim) {
            return Err(ShapeError::invalid(
                OP,
                format!("axis {axis} window exceeds extent {dim}"),
            ));
        }
    }
    Ok(tensor_spec_static(input.dtype, &spec.sizes))
}

pub fn infer_concat(inputs: &[&TensorSpec], axis: isize) -> ShapeResult<TensorSpec> {
    const OP: &str = "concat";
    let Some(first) = inputs.first() else {
        return Err(ShapeError::invalid(OP, "requires at least one operand"));
    };
    let mut out = dims_of(OP, first)?;
    let rank = out.len() as isize;
    let axis = if axis < 0 { axis + rank } else { axis };
    if axis < 0 || axis >= rank {
        return Err(ShapeError::invalid(OP, format!("axis out of range for rank {rank}")));
    }
    let axis = axis as usize;
    for input in &inputs[1..] {
        if input.dtype != first.dtype {
            return Err(ShapeError::invalid(OP, "operands must share dtype"));
        }
        let dims = dims_of(OP, input)?;
        if dims.len() != out.len() {
            return Err(ShapeError::invalid(OP, "operands must share rank"));
        }
        for (idx, (lhs, rhs)) in out.iter_mut().zip(dims.iter()).enumerate() {
            if idx == axis {
                *lhs += *rhs;
            } else if lhs != rhs {
                return Err(ShapeError::invalid(
                    OP,
                    format!("non-concatenated axis {idx} differs"),
                ));
            }
        }
    }
    Ok(tensor_spec_static(first.dtype, &out))
}

fn check_start_vector(op: &'static str, starts: &TensorSpec, rank: usize) -> ShapeResult<()> {
    if !starts.dtype.is_integer() {
        return Err(ShapeError::invalid(op, "start indices must be integers"));
    }
    let dims = dims_of(op, starts)?;
    if dims != [rank] {
        return Err(ShapeError::invalid(
            op,
            format!("start indices must be 1-D of length {rank}, got {dims:?}"),
        ));
    }
    Ok(())
}

fn check_window(op: &'static str, dims: &[usize], sizes: &[usize]) -> ShapeResult<()> {
    if sizes.len() != dims.len() {
        return Err(ShapeError::invalid(op, "sizes length must match input rank"));
    }
    for (axis, (size, dim)) in sizes.iter().zip(dims.iter()).enumerate() {
        if size > dim {
            return Err(ShapeError::invalid(
                op,
                format!("axis {axis} size {size} exceeds extent {dim}"),
            ));
        }
    }
    Ok(())
}

pub fn infer_dynamic_slice(
    input: &TensorSpec,
    starts: &TensorSpec,
    sizes: &[usize],
) -> ShapeResult<TensorSpec> {
    const OP: &str = "dynamic_slice";
    let dims = dims_of(OP, input)?;
    check_window(OP, &dims, sizes)?;
    check_start_vector(OP, starts, dims.len())?;
    Ok(tensor_spec_static(input.dtype, sizes))
}

pub fn infer_dynamic_update_slice(
    base: &TensorSpec,
    update: &TensorSpec,
    starts: &TensorSpec,
    sizes: &[usize],
) -> ShapeResult<TensorSpec> {
    const OP: &str = "dynamic_update_slice";
    let dims = dims_of(OP, base)?;
    check_window(OP, &dims, sizes)?;
    check_start_vector(OP, starts, dims.len())?;
    if update.dtype != base.dtype {
        return Err(ShapeError::invalid(OP, "update dtype must match base"));
    }
    if dims_of(OP, update)? != sizes {
        return Err(ShapeError::invalid(OP, "update shape must equal sizes"));
    }
    Ok(base.clone())
}

/// Infers the output of a generalized gather, validating its dimension numbers.
pub fn infer_gather(
    operand: &TensorSpec,
    indices: &TensorSpec,
    spec: &GatherSpec,
) -> ShapeResult<TensorSpec> {
    const OP: &str = "gather";
    let dnums = &spec.dimension_numbers;
    let operand_dims = dims_of(OP, operand)?;
    let indices_dims = dims_of(OP, indices)?;
    let rank = operand_dims.len();

    if !indices.dtype.is_integer() {
        return Err(ShapeError::invalid(OP, "indices must have an integer dtype"));
    }
    if dnums.index_vector_dim > indices_dims.len() {
        return Err(ShapeError::invalid(
            OP,
            format!(
                "index_vector_dim {} exceeds indices rank {}",
                dnums.index_vector_dim,
                indices_dims.len()
            ),
        ));
    }
    let index_len = indices_dims
        .get(dnums.index_vector_dim)
        .copied()
        .unwrap_or(1);
    if dnums.start_index_map.len() != index_len {
        return Err(ShapeError::invalid(
            OP,
            format!(
                "start_index_map has {} entries but index vectors have {index_len}",
                dnums.start_index_map.len()
            ),
        ));
    }
    let mut indexed = vec![false; rank];
    for &dim in &dnums.start_index_map {
        if dim >= rank || std::mem::replace(&mut indexed[dim], true) {
            return Err(ShapeError::invalid(
                OP,
                format!("start_index_map entry {dim} is out of range or repeated"),
            ));
        }
    }
    if spec.slice_sizes.len() != rank {
        return Err(ShapeError::invalid(
            OP,
            format!(
                "slice_sizes has {} entries for operand rank {rank}",
                spec.slice_sizes.len()
            ),
        ));
    }
    check_window(OP, &operand_dims, &spec.slice_sizes)?;
    if !is_strictly_ascending(&dnums.collapsed_slice_dims)
        || dnums.collapsed_slice_dims.iter().any(|dim| *dim >= rank)
    {
        return Err(ShapeError::invalid(
            OP,
            "collapsed_slice_dims must be ascending, unique and in range",
        ));
    }
    if let Some(dim) = dnums
        .collapsed_slice_dims
        .iter()
        .find(|dim| spec.slice_sizes[**dim] != 1)
    {
        return Err(ShapeError::invalid(
            OP,
            format!("collapsed dim {dim} has slice size {}", spec.slice_sizes[*dim]),
        ));
    }
    if dnums.offset_dims.len() + dnums.collapsed_slice_dims.len() != rank {
        return Err(ShapeError::invalid(
            OP,
            format!(
                "operand rank {rank} != {} offset dims + {} collapsed dims",
                dnums.offset_dims.len(),
                dnums.collapsed_slice_dims.len()
            ),
        ));
    }

    let mut batch = indices_dims;
    if dnums.index_vector_dim < batch.len() {
        batch.remove(dnums.index_vector_dim);
    }
    let output_rank = batch.len() + dnums.offset_dims.len();
    if !is_strictly_ascending(&dnums.offset_dims)
        || dnums.offset_dims.iter().any(|dim| *dim >= output_rank)
    {
        return Err(ShapeError::invalid(
            OP,
            "offset_dims must be ascending, unique and within the output rank",
        ));
    }

    let mut window = spec
        .slice_sizes
        .iter()
        .enumerate()
        .filter(|(dim, _)| dnums.collapsed_slice_dims.binary_search(dim).is_err())
        .map(|(_, size)| *size);
    let mut batch = batch.into_iter();
    let mut output = Vec::with_capacity(output_rank);
    for position in 0..output_rank {
        let next = if dnums.offset_dims.binary_search(&position).is_ok() {
            window.next()
        } else {
            batch.next()
        };
        output.push(next.ok_or_else(|| ShapeError::invalid(OP, "output rank mismatch"))?);
    }
    Ok(tensor_spec_static(operand.dtype, &output))
}

fn infer_while<R: RegionLookup + ?Sized>(
    carries: &[ValueType],
    cond_id: RegionId,
    body_id: RegionId,
    regions: &R,
) -> ShapeResult<ValueType> {
    const OP: &str = "while";
    let cond = regions
        .region(cond_id)
        .ok_or(ShapeError::MissingRegion {
            op: OP,
            region: cond_id.0,
        })?;
    let body = regions
        .region(body_id)
        .ok_or(ShapeError::MissingRegion {
            op: OP,
            region: body_id.0,
        })?;

    if cond.parameters != carries {
        return Err(ShapeError::invalid(OP, "cond region parameters must match carries"));
    }
    let predicate = ValueType::Tensor(tensor_spec_static(DType::I1, &[]));
    if cond.results != [predicate] {
        return Err(ShapeError::invalid(OP, "cond region must return one i1 scalar"));
    }
    if body.parameters != carries || body.results != carries {
        return Err(ShapeError::invalid(
            OP,
            "body region must map the carries onto themselves",
        ));
    }
    Ok(ValueType::Tuple(carries.to_vec()))
}
