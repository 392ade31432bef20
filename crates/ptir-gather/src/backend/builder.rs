//! Shape-inferring instruction builder used to stage rewrites and assemble regions.

use std::collections::HashMap;

use crate::backend::ptir_utils::shape_static;
use crate::backend::shape_inference::{infer_output, ShapeError};
use crate::backend::spec::{
    BroadcastToSpec, CompareSpec, ComparisonOp, ConcatSpec, DynamicSliceSpec,
    DynamicUpdateSliceSpec, ElementwiseBinaryOp, Function, Instruction, OpMetadata, Operand, Operation,
    Region, RegionId, ReshapeDim, ReshapeSpec, SliceSpec, TensorLiteral,
    TransposeSpec, ValueId, ValueType, WhileSpec,
};

/// Appends typed instructions to a detached body.
///
/// Ids are handed out sequentially from the starting id, so a builder seeded with
/// [`ProgramRewriter::next_value_id`] produces instructions that splice into the host
/// computation unchanged. Values defined outside the builder must be [`import`]ed before use.
///
/// [`ProgramRewriter::next_value_id`]: crate::backend::rewriter::ProgramRewriter::next_value_id
/// [`import`]: GraphBuilder::import
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, ValueType)>,
    value_types: HashMap<ValueId, ValueType>,
    instructions: Vec<Instruction>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: ValueId) -> Self {
        Self {
            next_value_id: first.0,
            ..Self::default()
        }
    }

    pub fn next_value_id(&self) -> ValueId {
        ValueId(self.next_value_id)
    }

    pub fn add_parameter(&mut self, ty: ValueType) -> ValueId {
        let id = self.allocate();
        self.value_types.insert(id, ty.clone());
        self.parameters.push((id, ty));
        id
    }

    /// Records the type of a value owned by the surrounding computation.
    pub fn import(&mut self, value: ValueId, ty: ValueType) {
        self.value_types.insert(value, ty);
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.value_types.get(&id)
    }

    /// Infers the output type of `op` and appends it.
    pub fn emit(&mut self, op: Operation, operands: Vec<Operand>) -> Result<ValueId, ShapeError> {
        self.emit_with_regions(op, operands, &[])
    }

    fn emit_with_regions(
        &mut self,
        op: Operation,
        operands: Vec<Operand>,
        regions: &[Region],
    ) -> Result<ValueId, ShapeError> {
        let operand_types = operands
            .iter()
            .map(|operand| self.operand_type(op.name(), operand))
            .collect::<Result<Vec<_>, _>>()?;
        let output = infer_output(&op, &operand_types, regions)?;
        let id = self.allocate();
        self.value_types.insert(id, output.clone());
        self.instructions
            .push(Instruction::new(id, op, operands, output));
        Ok(id)
    }

    pub fn constant(&mut self, literal: TensorLiteral) -> Result<ValueId, ShapeError> {
        self.emit(Operation::Constant(literal), Vec::new())
    }

    pub fn reshape(
        &mut self,
        input: impl Into<Operand>,
        dims: &[usize],
    ) -> Result<ValueId, ShapeError> {
        let new_shape = shape_static(dims)
            .dims()
            .iter()
            .cloned()
            .map(ReshapeDim::Explicit)
            .collect();
        self.emit(
            Operation::Reshape(ReshapeSpec { new_shape }),
            vec![input.into()],
        )
    }

    pub fn transpose(
        &mut self,
        input: impl Into<Operand>,
        perm: &[usize],
    ) -> Result<ValueId, ShapeError> {
        self.emit(
            Operation::Transpose(TransposeSpec {
                perm: perm.to_vec(),
            }),
            vec![input.into()],
        )
    }

    pub fn broadcast_to(
        &mut self,
        input: impl Into<Operand>,
        dims: &[usize],
    ) -> Result<ValueId, ShapeError> {
        self.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape_static(dims),
            }),
            vec![input.into()],
        )
    }

    pub fn slice(
        &mut self,
        input: impl Into<Operand>,
        starts: &[usize],
        sizes: &[usize],
    ) -> Result<ValueId, ShapeError> {
        self.emit(
            Operation::Slice(SliceSpec {
                starts: starts.to_vec(),
                sizes: sizes.to_vec(),
            }),
            vec![input.into()],
        )
    }

    pub fn concat(&mut self, inputs: &[ValueId], axis: isize) -> Result<ValueId, ShapeError> {
        self.emit(
            Operation::Concat(ConcatSpec { axis }),
            inputs.iter().copied().map(Operand::from).collect(),
        )
    }

    pub fn dynamic_slice(
        &mut self,
        input: impl Into<Operand>,
        starts: ValueId,
        sizes: &[usize],
    ) -> Result<ValueId, ShapeError> {
        self.emit(
            Operation::DynamicSlice(DynamicSliceSpec {
                sizes: sizes.to_vec(),
            }),
            vec![input.into(), starts.into()],
        )
    }

    pub fn dynamic_update_slice(
        &mut self,
        base: ValueId,
        update: ValueId,
        starts: ValueId,
        sizes: &[usize],
    ) -> Result<ValueId, ShapeError> {
        self.emit(
            Operation::DynamicUpdateSlice(DynamicUpdateSliceSpec {
                sizes: sizes.to_vec(),
            }),
            vec![base.into(), update.into(), starts.into()],
        )
    }

    pub fn compare(
        &mut self,
        lhs: ValueId,
        rhs: ValueId,
        op: ComparisonOp,
    ) -> Result<ValueId, ShapeError> {
        self.emit(
            Operation::Compare(CompareSpec { op }),
            vec![lhs.into(), rhs.into()],
        )
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, ShapeError> {
        self.emit(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
            vec![lhs.into(), rhs.into()],
        )
    }

    /// Emits a `while` over `carries`, checking both regions against the carried types.
    pub fn while_loop(
        &mut self,
        carries: Vec<Operand>,
        cond: &Region,
        body: &Region,
    ) -> Result<ValueId, ShapeError> {
        let regions = [cond.clone(), body.clone()];
        self.emit_with_regions(
            Operation::While(WhileSpec {
                cond_region: cond.id,
                body_region: body.id,
            }),
            carries,
            &regions,
        )
    }

    /// Attaches provenance to an instruction emitted by this builder.
    pub fn set_metadata(&mut self, value: ValueId, metadata: OpMetadata) -> bool {
        match self.instructions.iter_mut().find(|inst| inst.id == value) {
            Some(instruction) => {
                instruction.metadata = Some(metadata);
                true
            }
            None => false,
        }
    }

    /// Releases the staged instructions for splicing into another computation.
    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }

    /// Closes the builder into a function returning `result_ids`.
    pub fn finish_function(
        self,
        name: impl Into<String>,
        result_ids: Vec<ValueId>,
    ) -> Result<Function, ShapeError> {
        let results = self.result_types(&result_ids)?;
        let (parameter_ids, parameters) = self.parameters.into_iter().unzip();
        Ok(Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            result_ids,
        })
    }

    /// Closes the builder into a region returning `result_ids`.
    pub fn finish_region(
        self,
        id: RegionId,
        result_ids: Vec<ValueId>,
    ) -> Result<Region, ShapeError> {
        let results = self.result_types(&result_ids)?;
        let (parameter_ids, parameters) = self.parameters.into_iter().unzip();
        Ok(Region {
            id,
            parameters,
            parameter_ids,
            body: self.instructions,
            results,
            result_ids,
        })
    }

    fn result_types(&self, result_ids: &[ValueId]) -> Result<Vec<ValueType>, ShapeError> {
        result_ids
            .iter()
            .map(|value| {
                self.value_types
                    .get(value)
                    .cloned()
                    .ok_or(ShapeError::UnknownOperand {
                        op: "return",
                        value: *value,
                    })
            })
            .collect()
    }

    fn allocate(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }

    fn operand_type(&self, op: &'static str, operand: &Operand) -> Result<ValueType, ShapeError> {
        match operand {
            Operand::Value(value) => self
                .value_types
                .get(value)
                .cloned()
                .ok_or(ShapeError::UnknownOperand { op, value: *value }),
            Operand::TupleElement { tuple, index } => match self.value_types.get(tuple) {
                Some(ValueType::Tuple(elements)) => {
                    elements
                        .get(*index)
                        .cloned()
                        .ok_or_else(|| ShapeError::Invalid {
                            op,
                            detail: format!("tuple %{} has no element {index}", tuple.0),
                        })
                }
                Some(ValueType::Tensor(_)) => Err(ShapeError::Invalid {
                    op,
                    detail: format!("%{} is not a tuple", tuple.0),
                }),
                None => Err(ShapeError::UnknownOperand { op, value: *tuple }),
            },
            Operand::Literal(literal) => Ok(ValueType::Tensor(literal.spec.clone())),
        }
    }
}
