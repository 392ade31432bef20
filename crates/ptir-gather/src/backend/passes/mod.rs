//! Rewrite passes over PTIR computations.

mod gather_expander;

pub use gather_expander::{
    classify, GatherClass, GatherDescriptor, GatherExpander, GatherExpanderConfig,
    GatherExpanderMode, ParseModeError, MAX_GATHER_INDICES,
};

pub use crate::backend::optimizer::{FunctionPass, PassResult as FunctionPassResult};
