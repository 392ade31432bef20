//! Lowers `gather` into slices, broadcasts and counted loops.
//!
//! Each gather is validated into a [`GatherDescriptor`], classified from its shapes alone, and
//! replaced by a subgraph staged in a [`GraphBuilder`]. The staged instructions are spliced in
//! only once the whole replacement has been built, so a failing gather leaves the computation
//! untouched.

mod broadcast;
mod classify;
mod descriptor;
mod emit;
mod slice;
mod while_loop;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::builder::GraphBuilder;
use crate::backend::index::{IndexError, InstId};
use crate::backend::optimizer::{FunctionPass, PassContext, PassError, PassResult};
use crate::backend::pipeline::run_on_program;
use crate::backend::rewriter::ProgramRewriter;
use crate::backend::spec::{Computation, Operand, Operation, Program, ValueId, ValueType};

pub use classify::{classify, GatherClass};
pub use descriptor::{GatherDescriptor, MAX_GATHER_INDICES};

use emit::Expansion;

/// Which gathers the expander rewrites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatherExpanderMode {
    /// Rewrite every gather, emitting loops where needed.
    #[default]
    #[serde(rename = "eliminate-all")]
    EliminateAllGathers,
    /// Rewrite only gathers that lower without a loop.
    #[serde(rename = "eliminate-simple-only")]
    EliminateSimpleGathers,
}

impl GatherExpanderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GatherExpanderMode::EliminateAllGathers => "eliminate-all",
            GatherExpanderMode::EliminateSimpleGathers => "eliminate-simple-only",
        }
    }

    pub fn permits(self, class: GatherClass) -> bool {
        match self {
            GatherExpanderMode::EliminateAllGathers => true,
            GatherExpanderMode::EliminateSimpleGathers => class.is_simple(),
        }
    }
}

impl fmt::Display for GatherExpanderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown gather expander mode '{0}' (expected 'eliminate-all' or 'eliminate-simple-only')")]
pub struct ParseModeError(String);

impl FromStr for GatherExpanderMode {
    type Err = ParseModeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "eliminate-all" | "all" => Ok(GatherExpanderMode::EliminateAllGathers),
            "eliminate-simple-only" | "simple" => Ok(GatherExpanderMode::EliminateSimpleGathers),
            _ => Err(ParseModeError(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatherExpanderConfig {
    pub mode: GatherExpanderMode,
}

impl GatherExpanderConfig {
    pub fn new(mode: GatherExpanderMode) -> Self {
        Self { mode }
    }

    /// Default configuration with `PTIR_GATHER_EXPANDER_MODE` applied when set.
    pub fn from_env() -> Self {
        Self {
            mode: crate::env::gather_expander_mode().unwrap_or_default(),
        }
    }
}

/// Rewrites `gather` instructions into backend-friendly primitives.
#[derive(Debug, Clone, Default)]
pub struct GatherExpander {
    config: GatherExpanderConfig,
}

impl GatherExpander {
    const NAME: &'static str = "gather-expander";

    pub fn new(config: GatherExpanderConfig) -> Self {
        Self { config }
    }

    pub fn with_mode(mode: GatherExpanderMode) -> Self {
        Self::new(GatherExpanderConfig::new(mode))
    }

    pub fn config(&self) -> &GatherExpanderConfig {
        &self.config
    }

    /// Expands gathers in every function and pre-existing region of `program`.
    pub fn run_on_program(&self, program: &mut Program) -> Result<bool, PassError> {
        run_on_program(self, program).map(|result| result.changed)
    }

    fn expand(
        &self,
        rewriter: &mut ProgramRewriter<'_>,
        inst: InstId,
        cx: &mut PassContext,
    ) -> Result<PassResult, PassError> {
        let Some(instruction) = rewriter.instruction(inst).cloned() else {
            return Ok(PassResult::default());
        };
        let Operation::Gather(spec) = &instruction.op else {
            return Ok(PassResult::default());
        };
        let value = instruction.id;
        let [operand, indices] = instruction.operands.as_slice() else {
            return Err(PassError::MalformedDescriptor {
                value,
                reason: format!("expected 2 operands, got {}", instruction.operands.len()),
            });
        };

        let operand_ty = operand_type(rewriter, value, operand)?;
        let indices_ty = operand_type(rewriter, value, indices)?;
        let desc =
            GatherDescriptor::new(value, &operand_ty, &indices_ty, spec, &instruction.output)?;
        let class = classify(&desc);
        if !self.config.mode.permits(class) {
            tracing::debug!(
                value = value.0,
                class = class.as_str(),
                mode = %self.config.mode,
                "leaving gather in place"
            );
            return Ok(PassResult::default());
        }

        let mut builder = GraphBuilder::starting_at(rewriter.next_value_id());
        for used in instruction.operands.iter().filter_map(Operand::value) {
            if let Some(ty) = rewriter.type_of(used) {
                builder.import(used, ty.clone());
            }
        }

        let mut regions = Vec::new();
        let expansion: Expansion = match class {
            GatherClass::Empty => slice::expand_empty(&mut builder, &desc),
            GatherClass::Broadcast => {
                broadcast::expand_broadcast(&mut builder, operand.clone(), &desc)
            }
            GatherClass::Slice => {
                slice::expand_slice(&mut builder, operand.clone(), indices.clone(), &desc)
            }
            GatherClass::General => while_loop::expand_loop(
                &mut builder,
                operand.clone(),
                indices.clone(),
                &desc,
                cx,
                &mut regions,
            ),
        }
        .map_err(|source| PassError::BuilderFailure { value, source })?;

        if let Some(metadata) = instruction.metadata.clone() {
            builder.set_metadata(expansion.metadata_target, metadata);
        }

        let staged = builder.into_instructions();
        let emitted = staged.len();
        let label = rewriter.computation().label();
        let index_error = |source: IndexError| PassError::Index {
            computation: label.clone(),
            source,
        };
        rewriter.splice_before(inst, staged).map_err(index_error)?;
        rewriter
            .replace_all_uses(value, expansion.root)
            .map_err(index_error)?;
        rewriter.redirect_results(value, expansion.root);
        rewriter.erase_inst(inst).map_err(index_error)?;

        let regions_added = regions.len();
        for region in regions {
            cx.push_region(region);
        }

        let mut erased_insts = 1;
        if let Some(indices_value) = indices.value() {
            if erase_if_dead(rewriter, indices_value) {
                erased_insts += 1;
            }
        }

        tracing::debug!(
            value = value.0,
            class = class.as_str(),
            root = expansion.root.0,
            emitted,
            "expanded gather"
        );
        Ok(PassResult {
            changed: true,
            rewrites_applied: 1,
            erased_insts,
            regions_added,
        })
    }
}

impl FunctionPass for GatherExpander {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        computation: &mut dyn Computation,
        cx: &mut PassContext,
    ) -> Result<PassResult, PassError> {
        let label = computation.label();
        let mut rewriter =
            ProgramRewriter::new(computation).map_err(|source| PassError::Index {
                computation: label.clone(),
                source,
            })?;

        let gathers = rewriter
            .insts_in_order()
            .into_iter()
            .filter(|inst| matches!(rewriter.op(*inst), Some(Operation::Gather(_))))
            .collect::<Vec<_>>();

        let mut result = PassResult::default();
        for inst in gathers {
            match self.expand(&mut rewriter, inst, cx) {
                Ok(stats) => result = result.merge(stats),
                Err(err) => {
                    tracing::warn!(computation = %label, error = %err, "gather expansion failed");
                    return Err(err);
                }
            }
        }
        Ok(result)
    }
}

fn operand_type(
    rewriter: &ProgramRewriter<'_>,
    gather: ValueId,
    operand: &Operand,
) -> Result<ValueType, PassError> {
    let missing = |reason: String| PassError::MalformedDescriptor {
        value: gather,
        reason,
    };
    match operand {
        Operand::Value(value) => rewriter
            .type_of(*value)
            .cloned()
            .ok_or_else(|| missing(format!("operand %{} is undefined", value.0))),
        Operand::TupleElement { tuple, index } => match rewriter.type_of(*tuple) {
            Some(ValueType::Tuple(elements)) => elements
                .get(*index)
                .cloned()
                .ok_or_else(|| missing(format!("tuple %{} has no element {index}", tuple.0))),
            _ => Err(missing(format!("%{} is not a tuple", tuple.0))),
        },
        Operand::Literal(literal) => Ok(ValueType::Tensor(literal.spec.clone())),
    }
}

/// Erases the instruction defining `value` once nothing reads it. Loops are never removed.
fn erase_if_dead(rewriter: &mut ProgramRewriter<'_>, value: ValueId) -> bool {
    let Some(def) = rewriter.inst_of(value) else {
        return false;
    };
    if !rewriter.users_of(value).is_empty()
        || rewriter.is_result(value)
        || matches!(rewriter.op(def), Some(Operation::While(_)))
    {
        return false;
    }
    rewriter.erase_inst(def).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_canonical_names_and_aliases() {
        assert_eq!(
            "eliminate-all".parse::<GatherExpanderMode>(),
            Ok(GatherExpanderMode::EliminateAllGathers)
        );
        assert_eq!(
            " Simple ".parse::<GatherExpanderMode>(),
            Ok(GatherExpanderMode::EliminateSimpleGathers)
        );
        let err = "loops".parse::<GatherExpanderMode>().unwrap_err();
        assert!(err.to_string().contains("'loops'"));
    }

    #[test]
    fn mode_display_round_trips_through_from_str() {
        for mode in [
            GatherExpanderMode::EliminateAllGathers,
            GatherExpanderMode::EliminateSimpleGathers,
        ] {
            assert_eq!(mode.to_string().parse::<GatherExpanderMode>(), Ok(mode));
        }
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: GatherExpanderConfig = serde_json::from_str("{}").expect("empty config");
        assert_eq!(config.mode, GatherExpanderMode::EliminateAllGathers);

        let config: GatherExpanderConfig =
            serde_json::from_str(r#"{"mode":"eliminate-simple-only"}"#).expect("simple config");
        assert_eq!(config.mode, GatherExpanderMode::EliminateSimpleGathers);
        assert_eq!(
            serde_json::to_string(&config).expect("serialize"),
            r#"{"mode":"eliminate-simple-only"}"#
        );
    }

    #[test]
    fn simple_mode_only_permits_loop_free_classes() {
        let simple = GatherExpanderMode::EliminateSimpleGathers;
        assert!(simple.permits(GatherClass::Empty));
        assert!(simple.permits(GatherClass::Broadcast));
        assert!(simple.permits(GatherClass::Slice));
        assert!(!simple.permits(GatherClass::General));
        assert!(GatherExpanderMode::EliminateAllGathers.permits(GatherClass::General));
    }
}
