//! Gather expansion for PTIR programs.
//!
//! [`GatherExpander`] rewrites generalized `gather` instructions into primitives a backend
//! without native gather support can run: fixed slices, dynamic slices, broadcasts and counted
//! `while` loops.

pub mod backend;
mod env;

pub use backend::optimizer::{FunctionPass, PassContext, PassError, PassResult};
pub use backend::passes::{
    GatherClass, GatherExpander, GatherExpanderConfig, GatherExpanderMode,
};
pub use backend::spec::{DType, Program, Shape, TensorSpec};
pub use backend::verify::{verify_program, VerifyError};
