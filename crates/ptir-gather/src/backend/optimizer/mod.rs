//! Pass infrastructure shared by PTIR rewrites.
//!
//! A pass rewrites one [`Computation`] at a time; the module-wide runner in
//! [`crate::backend::pipeline`] walks every function and region of a [`Program`] and appends the
//! regions passes create.
//!
//! [`Program`]: crate::backend::spec::Program

mod context;

use thiserror::Error;

use crate::backend::index::IndexError;
use crate::backend::shape_inference::ShapeError;
use crate::backend::spec::{Computation, ValueId};

pub use context::PassContext;

/// Result returned by a [`FunctionPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the IR.
    pub changed: bool,
    /// Number of instructions replaced by the pass.
    pub rewrites_applied: usize,
    /// Instructions removed by the pass, replaced roots included.
    pub erased_insts: usize,
    /// Control-flow regions created by the pass.
    pub regions_added: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_insts: self.erased_insts + other.erased_insts,
            regions_added: self.regions_added + other.regions_added,
        }
    }
}

/// Failure that stops a pass on a specific instruction.
///
/// The computation is left exactly as it was before the failing rewrite was attempted.
#[derive(Debug, Error)]
pub enum PassError {
    #[error(
        "Gather operations with more than {limit} gather indices are not supported (found {actual})"
    )]
    UnsupportedSize { limit: u64, actual: u128 },
    #[error("malformed gather %{}: {reason}", value.0)]
    MalformedDescriptor { value: ValueId, reason: String },
    #[error("failed to build replacement for %{}: {source}", value.0)]
    BuilderFailure {
        value: ValueId,
        #[source]
        source: ShapeError,
    },
    #[error("invalid computation {computation}: {source}")]
    Index {
        computation: String,
        #[source]
        source: IndexError,
    },
}

impl PassError {
    /// Returns `true` for the size-bound error callers may treat as "leave this gather alone".
    pub fn is_unsupported_size(&self) -> bool {
        matches!(self, PassError::UnsupportedSize { .. })
    }
}

/// Canonical interface implemented by passes that operate on a single computation.
pub trait FunctionPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(
        &self,
        computation: &mut dyn Computation,
        cx: &mut PassContext,
    ) -> Result<PassResult, PassError>;
}
