use std::collections::HashSet;

use crate::backend::{
    index::{ComputationIndices, DefId, IndexError, InstId},
    spec::{Computation, Instruction, Operand, Operation, TensorLiteral, ValueId, ValueType},
};

/// Mutable IR editor with stable instruction identifiers and SSA accounting.
///
/// Works over any [`Computation`], so the same rewrite code runs on functions and on the
/// bodies of control-flow regions.
pub struct ProgramRewriter<'a> {
    computation: &'a mut dyn Computation,
    indices: ComputationIndices,
}

impl<'a> ProgramRewriter<'a> {
    /// Creates a rewriter for `computation`, indexing its body.
    pub fn new(computation: &'a mut dyn Computation) -> Result<Self, IndexError> {
        let indices = ComputationIndices::build(computation)?;
        Ok(Self {
            computation,
            indices,
        })
    }

    /// Read-only access to the computation being edited.
    pub fn computation(&self) -> &dyn Computation {
        &*self.computation
    }

    pub fn instruction(&self, inst: InstId) -> Option<&Instruction> {
        let pos = self.indices.position(inst)?;
        self.computation.body().get(pos)
    }

    /// Returns the operation referenced by `inst`.
    pub fn op(&self, inst: InstId) -> Option<&Operation> {
        self.instruction(inst).map(|instruction| &instruction.op)
    }

    /// Returns the operands for the given instruction.
    pub fn operands(&self, inst: InstId) -> &[Operand] {
        self.instruction(inst)
            .map(|instruction| instruction.operands.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the SSA value produced by the instruction.
    pub fn value_of(&self, inst: InstId) -> Option<ValueId> {
        self.indices.value_of(inst)
    }

    /// Returns the type recorded for the value.
    pub fn type_of(&self, value: ValueId) -> Option<&ValueType> {
        self.indices.type_of(value)
    }

    /// Returns the instruction defining the provided value.
    pub fn inst_of(&self, value: ValueId) -> Option<InstId> {
        self.indices.inst_of(value)
    }

    pub fn def_of(&self, value: ValueId) -> Option<DefId> {
        self.indices.def_of(value)
    }

    /// Returns the recorded users for the value.
    pub fn users_of(&self, value: ValueId) -> &[InstId] {
        self.indices.users_of(value)
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.indices.contains(inst)
    }

    pub fn insts_in_order(&self) -> Vec<InstId> {
        self.indices.ordered_inst_ids()
    }

    /// Returns `true` when `value` is listed among the computation results.
    pub fn is_result(&self, value: ValueId) -> bool {
        self.computation.result_ids().contains(&value)
    }

    /// First value id that no instruction or parameter uses yet.
    ///
    /// Staging builders allocate from here so their instructions can be spliced in verbatim.
    pub fn next_value_id(&self) -> ValueId {
        ValueId(self.indices.next_value())
    }

    /// Replaces all operand uses of `from` with `to`. Computation results are left alone.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) -> Result<(), IndexError> {
        if from == to {
            return Ok(());
        }
        let consumers = self.indices.users_of(from).to_vec();
        for inst in consumers {
            let pos = self
                .indices
                .position(inst)
                .ok_or(IndexError::UnknownInstruction(inst))?;
            let instruction = &mut self.computation.body_mut()[pos];
            for operand in &mut instruction.operands {
                match operand {
                    Operand::Value(value) if *value == from => *value = to,
                    Operand::TupleElement { tuple, .. } if *tuple == from => *tuple = to,
                    _ => {}
                }
            }
            self.indices.update_operand_use(inst, from, to)?;
        }
        self.indices.clear_users(from);
        Ok(())
    }

    /// Points every computation result that names `from` at `to`, returning how many changed.
    pub fn redirect_results(&mut self, from: ValueId, to: ValueId) -> usize {
        let mut redirected = 0;
        for result in self.computation.result_ids_mut().iter_mut() {
            if *result == from {
                *result = to;
                redirected += 1;
            }
        }
        redirected
    }

    /// Erases the instruction identified by `inst`, returning it.
    ///
    /// Fails when the value still has users or is a computation result.
    pub fn erase_inst(&mut self, inst: InstId) -> Result<Instruction, IndexError> {
        let value = self
            .indices
            .value_of(inst)
            .ok_or(IndexError::UnknownInstruction(inst))?;
        let users = self.indices.users_of(value).len();
        if users != 0 {
            return Err(IndexError::LiveUses { value, users });
        }
        if self.is_result(value) {
            return Err(IndexError::ResultValue { value });
        }
        let pos = self
            .indices
            .position(inst)
            .ok_or(IndexError::UnknownInstruction(inst))?;
        let instruction = self.computation.body_mut().remove(pos);
        self.indices.remove_instruction(inst, &instruction);
        Ok(instruction)
    }

    /// Inserts a new instruction before `at`, returning its identifiers.
    pub fn insert_before(
        &mut self,
        at: InstId,
        op: Operation,
        operands: Vec<Operand>,
        output: ValueType,
    ) -> Result<(InstId, ValueId), IndexError> {
        let value_id = self.indices.allocate_value();
        let instruction = Instruction::new(value_id, op, operands, output);
        let inserted = self.splice_before(at, vec![instruction])?;
        Ok((inserted[0], value_id))
    }

    /// Materialises a constant literal by inserting a `Constant` operation before `at`.
    pub fn materialize_constant(
        &mut self,
        at: InstId,
        literal: TensorLiteral,
    ) -> Result<(InstId, ValueId), IndexError> {
        let output = ValueType::Tensor(literal.spec.clone());
        self.insert_before(at, Operation::Constant(literal), Vec::new(), output)
    }

    /// Inserts a pre-built instruction sequence before `at`, keeping the ids it carries.
    ///
    /// The whole batch is checked before anything is touched: ids must be fresh and unique, and
    /// every operand must name a value defined ahead of `at` or earlier in the batch. On error
    /// the computation is unchanged.
    pub fn splice_before(
        &mut self,
        at: InstId,
        instructions: Vec<Instruction>,
    ) -> Result<Vec<InstId>, IndexError> {
        let pos = self
            .indices
            .position(at)
            .ok_or(IndexError::UnknownInstruction(at))?;

        let mut staged: HashSet<ValueId> = HashSet::with_capacity(instructions.len());
        for instruction in &instructions {
            for referenced in instruction.operands.iter().filter_map(Operand::value) {
                if !staged.contains(&referenced) && !self.dominates(referenced, pos) {
                    return Err(IndexError::MissingValueDefinition { value: referenced });
                }
            }
            if self.indices.type_of(instruction.id).is_some() || !staged.insert(instruction.id) {
                return Err(IndexError::DuplicateValue {
                    value: instruction.id,
                });
            }
        }

        let inserted = self.indices.insert_instructions(pos, &instructions)?;
        let body = self.computation.body_mut();
        body.splice(pos..pos, instructions);
        Ok(inserted)
    }

    /// Re-indexes the computation from scratch, surfacing any SSA violation.
    pub fn verify(&self) -> Result<(), IndexError> {
        ComputationIndices::build(&*self.computation).map(|_| ())
    }

    fn dominates(&self, value: ValueId, pos: usize) -> bool {
        match self.indices.def_of(value) {
            Some(DefId::Param { .. }) => true,
            Some(DefId::Inst(inst)) => self
                .indices
                .position(inst)
                .is_some_and(|def_pos| def_pos < pos),
            None => false,
        }
    }
}
