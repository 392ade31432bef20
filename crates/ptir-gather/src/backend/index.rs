use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;
use thiserror::Error;

use crate::backend::spec::{Computation, Instruction, Operand, ValueId, ValueType};

/// Stable identifier assigned to each instruction when indexing a computation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct InstId(pub u32);

/// Definition site of a value: a computation parameter or an instruction result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefId {
    Param { index: u32 },
    Inst(InstId),
}

/// Structural indices for a single function or region body.
#[derive(Debug, Clone)]
pub struct ComputationIndices {
    inst_values: HashMap<InstId, ValueId>,
    value_types: HashMap<ValueId, ValueType>,
    params: Vec<ValueId>,
    param_index_of: HashMap<ValueId, u32>,
    pos_of: HashMap<InstId, usize>,
    value_to_inst: HashMap<ValueId, InstId>,
    users: HashMap<ValueId, SmallVec<[InstId; 4]>>,
    next_value: u32,
    next_inst: u32,
}

impl ComputationIndices {
    /// Builds indices for `computation` and validates its SSA invariants.
    ///
    /// Every operand must be defined by a parameter or an earlier instruction, every id must be
    /// defined once, and every result id must be defined somewhere in the computation.
    pub fn build(computation: &dyn Computation) -> Result<Self, IndexError> {
        let parameter_ids = computation.parameter_ids();
        let parameters = computation.parameters();
        if parameter_ids.len() != parameters.len() {
            return Err(IndexError::SignatureMismatch {
                what: "parameters",
                ids: parameter_ids.len(),
                types: parameters.len(),
            });
        }
        if computation.result_ids().len() != computation.results().len() {
            return Err(IndexError::SignatureMismatch {
                what: "results",
                ids: computation.result_ids().len(),
                types: computation.results().len(),
            });
        }

        let mut seen_values: HashSet<ValueId> = HashSet::new();
        let mut value_types: HashMap<ValueId, ValueType> = HashMap::new();
        let mut params = Vec::with_capacity(parameters.len());
        let mut param_index_of = HashMap::new();
        let mut pos_of = HashMap::new();
        let mut value_to_inst = HashMap::new();
        let mut inst_values = HashMap::new();
        let mut users: HashMap<ValueId, SmallVec<[InstId; 4]>> = HashMap::new();

        for (index, (param_id, param_ty)) in parameter_ids.iter().zip(parameters).enumerate() {
            if !seen_values.insert(*param_id) {
                return Err(IndexError::DuplicateValue { value: *param_id });
            }
            params.push(*param_id);
            param_index_of.insert(*param_id, index as u32);
            value_types.insert(*param_id, param_ty.clone());
        }

        for (index, instruction) in computation.body().iter().enumerate() {
            let inst_id = InstId(index as u32);

            for referenced in instruction.operands.iter().filter_map(Operand::value) {
                if !value_types.contains_key(&referenced) {
                    return Err(IndexError::MissingValueDefinition { value: referenced });
                }
                users.entry(referenced).or_default().push(inst_id);
            }

            if !seen_values.insert(instruction.id) {
                return Err(IndexError::DuplicateValue {
                    value: instruction.id,
                });
            }

            pos_of.insert(inst_id, index);
            value_to_inst.insert(instruction.id, inst_id);
            inst_values.insert(inst_id, instruction.id);
            value_types.insert(instruction.id, instruction.output.clone());
        }

        for result_id in computation.result_ids() {
            if !value_types.contains_key(result_id) {
                return Err(IndexError::MissingValueDefinition { value: *result_id });
            }
        }

        let max_value = parameter_ids
            .iter()
            .chain(computation.body().iter().map(|inst| &inst.id))
            .map(|id| id.0)
            .max();

        Ok(ComputationIndices {
            inst_values,
            value_types,
            params,
            param_index_of,
            pos_of,
            value_to_inst,
            users,
            next_value: max_value.map_or(0, |max| max + 1),
            next_inst: computation.body().len() as u32,
        })
    }

    /// Returns the instruction position for the provided identifier.
    pub fn position(&self, inst: InstId) -> Option<usize> {
        self.pos_of.get(&inst).copied()
    }

    /// Returns the SSA value defined by the provided instruction.
    pub fn value_of(&self, inst: InstId) -> Option<ValueId> {
        self.inst_values.get(&inst).copied()
    }

    /// Returns the instruction producing the given value, if already defined.
    pub fn inst_of(&self, value: ValueId) -> Option<InstId> {
        self.value_to_inst.get(&value).copied()
    }

    pub fn def_of(&self, value: ValueId) -> Option<DefId> {
        if let Some(index) = self.param_index_of.get(&value).copied() {
            return Some(DefId::Param { index });
        }
        self.inst_of(value).map(DefId::Inst)
    }

    pub fn value_of_def(&self, def: DefId) -> Option<ValueId> {
        match def {
            DefId::Param { index } => self.params.get(index as usize).copied(),
            DefId::Inst(inst) => self.value_of(inst),
        }
    }

    /// Returns the type associated with a given SSA value.
    pub fn type_of(&self, value: ValueId) -> Option<&ValueType> {
        self.value_types.get(&value)
    }

    /// Returns the users recorded for a given SSA value.
    pub fn users_of(&self, value: ValueId) -> &[InstId] {
        self.users
            .get(&value)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.pos_of.contains_key(&inst)
    }

    /// First value id not yet used by the computation.
    pub fn next_value(&self) -> u32 {
        self.next_value
    }

    pub fn ordered_inst_ids(&self) -> Vec<InstId> {
        let mut entries: Vec<_> = self
            .pos_of
            .iter()
            .map(|(inst, pos)| (*inst, *pos))
            .collect();
        entries.sort_by_key(|&(_, pos)| pos);
        entries.into_iter().map(|(inst, _)| inst).collect()
    }

    pub(crate) fn allocate_inst(&mut self) -> InstId {
        let inst = InstId(self.next_inst);
        self.next_inst += 1;
        inst
    }

    pub(crate) fn allocate_value(&mut self) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        value
    }

    /// Records `instructions` as occupying positions `pos..pos + instructions.len()`.
    ///
    /// Callers validate the batch beforehand; ids are returned in body order.
    pub(crate) fn insert_instructions(
        &mut self,
        pos: usize,
        instructions: &[Instruction],
    ) -> Result<Vec<InstId>, IndexError> {
        for instruction in instructions {
            if self.value_types.contains_key(&instruction.id) {
                return Err(IndexError::DuplicateValue {
                    value: instruction.id,
                });
            }
        }

        self.shift_positions_from(pos, instructions.len() as isize);
        let mut inserted = Vec::with_capacity(instructions.len());
        for (offset, instruction) in instructions.iter().enumerate() {
            let inst_id = self.allocate_inst();
            self.pos_of.insert(inst_id, pos + offset);
            self.value_to_inst.insert(instruction.id, inst_id);
            self.inst_values.insert(inst_id, instruction.id);
            self.value_types
                .insert(instruction.id, instruction.output.clone());
            self.add_operand_users(inst_id, &instruction.operands)?;
            self.next_value = self.next_value.max(instruction.id.0 + 1);
            inserted.push(inst_id);
        }
        Ok(inserted)
    }

    pub(crate) fn remove_instruction(&mut self, inst: InstId, instruction: &Instruction) {
        if let Some(pos) = self.pos_of.remove(&inst) {
            self.shift_positions_from(pos + 1, -1);
        }
        if let Some(value) = self.inst_values.remove(&inst) {
            self.value_to_inst.remove(&value);
            self.value_types.remove(&value);
            self.users.remove(&value);
        }
        self.remove_operand_users(inst, &instruction.operands);
    }

    pub(crate) fn update_operand_use(
        &mut self,
        inst: InstId,
        from: ValueId,
        to: ValueId,
    ) -> Result<(), IndexError> {
        if !self.value_types.contains_key(&to) {
            return Err(IndexError::MissingValueDefinition { value: to });
        }

        if let Some(list) = self.users.get_mut(&from) {
            list.retain(|id| *id != inst);
            if list.is_empty() {
                self.users.remove(&from);
            }
        }
        self.users.entry(to).or_default().push(inst);
        Ok(())
    }

    pub(crate) fn clear_users(&mut self, value: ValueId) {
        self.users.remove(&value);
    }

    fn shift_positions_from(&mut self, start: usize, delta: isize) {
        if delta == 0 {
            return;
        }
        for (_, pos) in self.pos_of.iter_mut() {
            if *pos >= start {
                if delta.is_positive() {
                    *pos += delta.unsigned_abs();
                } else {
                    *pos -= delta.unsigned_abs();
                }
            }
        }
    }

    fn add_operand_users(&mut self, inst: InstId, operands: &[Operand]) -> Result<(), IndexError> {
        for referenced in operands.iter().filter_map(Operand::value) {
            if !self.value_types.contains_key(&referenced) {
                return Err(IndexError::MissingValueDefinition { value: referenced });
            }
            self.users.entry(referenced).or_default().push(inst);
        }
        Ok(())
    }

    fn remove_operand_users(&mut self, inst: InstId, operands: &[Operand]) {
        for referenced in operands.iter().filter_map(Operand::value) {
            if let Some(list) = self.users.get_mut(&referenced) {
                list.retain(|id| *id != inst);
                if list.is_empty() {
                    self.users.remove(&referenced);
                }
            }
        }
    }
}

/// Errors surfaced when indexing or editing a computation body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("duplicate value definition for %{}", value.0)]
    DuplicateValue { value: ValueId },
    #[error("value %{} is used but never defined", value.0)]
    MissingValueDefinition { value: ValueId },
    #[error("{what}: {ids} ids but {types} types")]
    SignatureMismatch {
        what: &'static str,
        ids: usize,
        types: usize,
    },
    #[error("instruction {0:?} is not part of the computation")]
    UnknownInstruction(InstId),
    #[error("cannot erase %{} while it still has {users} users", value.0)]
    LiveUses { value: ValueId, users: usize },
    #[error("value %{} is a computation result", value.0)]
    ResultValue { value: ValueId },
}
