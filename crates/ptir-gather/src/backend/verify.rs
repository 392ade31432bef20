//! Caller-side structural verifier for PTIR programs.

use std::collections::HashSet;

use thiserror::Error;

use crate::backend::index::{ComputationIndices, IndexError};
use crate::backend::shape_inference::{infer_output, RegionLookup, ShapeError};
use crate::backend::spec::{format_value_type, Computation, Operand, Program, ValueId, ValueType};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{computation}: {source}")]
    Index {
        computation: String,
        #[source]
        source: IndexError,
    },
    #[error("{computation}: %{}: {source}", value.0)]
    Shape {
        computation: String,
        value: ValueId,
        #[source]
        source: ShapeError,
    },
    #[error("{computation}: %{} declares {declared} but infers {inferred}", value.0)]
    OutputMismatch {
        computation: String,
        value: ValueId,
        declared: String,
        inferred: String,
    },
    #[error("{computation}: result {index} declares {declared} but %{} is {actual}", value.0)]
    ResultMismatch {
        computation: String,
        index: usize,
        value: ValueId,
        declared: String,
        actual: String,
    },
    #[error("region ^r{0} is defined more than once")]
    DuplicateRegion(usize),
    #[error("entry function @{0} is not defined")]
    MissingEntry(String),
}

/// Verifies every function and region of `program`.
pub fn verify_program(program: &Program) -> Result<(), VerifyError> {
    let mut seen = HashSet::new();
    for region in &program.regions {
        if !seen.insert(region.id) {
            return Err(VerifyError::DuplicateRegion(region.id.0));
        }
    }
    if program.entry_function().is_none() {
        return Err(VerifyError::MissingEntry(program.entry.clone()));
    }
    for function in &program.functions {
        verify_computation(function, program)?;
    }
    for region in &program.regions {
        verify_computation(region, program)?;
    }
    Ok(())
}

/// Verifies SSA form and re-infers the type of every instruction in `computation`.
pub fn verify_computation<R: RegionLookup + ?Sized>(
    computation: &dyn Computation,
    regions: &R,
) -> Result<(), VerifyError> {
    let label = computation.label();
    let indices =
        ComputationIndices::build(computation).map_err(|source| VerifyError::Index {
            computation: label.clone(),
            source,
        })?;

    for instruction in computation.body() {
        let shape_error = |source| VerifyError::Shape {
            computation: label.clone(),
            value: instruction.id,
            source,
        };
        let operand_types = instruction
            .operands
            .iter()
            .map(|operand| operand_type(&indices, instruction.op.name(), operand))
            .collect::<Result<Vec<_>, _>>()
            .map_err(shape_error)?;
        let inferred =
            infer_output(&instruction.op, &operand_types, regions).map_err(shape_error)?;
        if inferred != instruction.output {
            return Err(VerifyError::OutputMismatch {
                computation: label,
                value: instruction.id,
                declared: format_value_type(&instruction.output),
                inferred: format_value_type(&inferred),
            });
        }
    }

    for (index, (value, declared)) in computation
        .result_ids()
        .iter()
        .zip(computation.results())
        .enumerate()
    {
        let actual = indices.type_of(*value);
        if actual != Some(declared) {
            return Err(VerifyError::ResultMismatch {
                computation: label,
                index,
                value: *value,
                declared: format_value_type(declared),
                actual: actual.map_or_else(|| "undefined".to_string(), format_value_type),
            });
        }
    }
    Ok(())
}

fn operand_type(
    indices: &ComputationIndices,
    op: &'static str,
    operand: &Operand,
) -> Result<ValueType, ShapeError> {
    match operand {
        Operand::Value(value) => indices
            .type_of(*value)
            .cloned()
            .ok_or(ShapeError::UnknownOperand { op, value: *value }),
        Operand::TupleElement { tuple, index } => match indices.type_of(*tuple) {
            Some(ValueType::Tuple(elements)) => elements.get(*index).cloned().ok_or_else(|| {
                ShapeError::Invalid {
                    op,
                    detail: format!("tuple %{} has no element {index}", tuple.0),
                }
            }),
            _ => Err(ShapeError::Invalid {
                op,
                detail: format!("%{} is not a tuple", tuple.0),
            }),
        },
        Operand::Literal(literal) => Ok(ValueType::Tensor(literal.spec.clone())),
    }
}
