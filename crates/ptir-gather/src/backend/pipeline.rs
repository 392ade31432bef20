use tracing::debug_span;

use crate::backend::optimizer::{FunctionPass, PassContext, PassError, PassResult};
use crate::backend::spec::{Computation, Program};

/// Runs `pass` over every function of `program`, then over every region that existed before the
/// run, in declaration order.
///
/// Regions created by the pass are appended to `program.regions` even when a later computation
/// fails, since the rewrites that reference them have already been applied.
#[tracing::instrument(level = "debug", skip_all, fields(pass = pass.name(), entry = %program.entry))]
pub fn run_on_program(
    pass: &dyn FunctionPass,
    program: &mut Program,
) -> Result<PassResult, PassError> {
    let mut cx = PassContext::for_program(program);
    let mut totals = PassResult::default();
    let outcome = run_computations(pass, program, &mut cx, &mut totals);
    program.regions.extend(cx.take_regions());
    tracing::debug!(
        changed = totals.changed,
        rewrites = totals.rewrites_applied,
        erased = totals.erased_insts,
        regions = totals.regions_added,
        "pass finished"
    );
    outcome.map(|()| totals)
}

fn run_computations(
    pass: &dyn FunctionPass,
    program: &mut Program,
    cx: &mut PassContext,
    totals: &mut PassResult,
) -> Result<(), PassError> {
    let existing_regions = program.regions.len();
    let functions = program.functions.iter_mut().map(|f| f as &mut dyn Computation);
    let regions = program
        .regions
        .iter_mut()
        .take(existing_regions)
        .map(|r| r as &mut dyn Computation);

    for computation in functions.chain(regions) {
        let label = computation.label();
        let _span = debug_span!("computation", name = %label).entered();
        let stats = pass.run(computation, cx)?;
        *totals = totals.merge(stats);
    }
    Ok(())
}
