//! Property-based tests for the gather expander.
//!
//! Key invariants:
//! - eliminate-all removes every gather and preserves the result type exactly
//! - expanded programs pass the verifier
//! - loop state never gains extent-1 dims the window or indices did not already have
//! - eliminate-simple-only never emits a loop and keeps exactly the general gathers

mod gather_support;

use gather_support::{carried_dims, count_ops, is_gather, is_while, result_type, GatherCase};
use proptest::prelude::*;
use ptir_gather::backend::passes::{classify, GatherDescriptor};
use ptir_gather::backend::spec::{Operation, ValueId};
use ptir_gather::{verify_program, GatherExpander, GatherExpanderMode};

/// Derives a valid gather from raw shapes and a bag of selector bits.
fn build_case(operand: Vec<usize>, batch: Vec<usize>, bits: u64, implicit: bool) -> GatherCase {
    let rank = operand.len();
    let bit = |index: u32| (bits >> index) & 1 == 1;

    let mut start_index_map = (0..rank).filter(|dim| bit(*dim as u32)).collect::<Vec<_>>();
    if start_index_map.is_empty() {
        start_index_map.push(0);
    }
    if bit(10) {
        start_index_map.reverse();
    }
    if implicit {
        start_index_map.truncate(1);
    }

    let collapsed_slice_dims = (0..rank)
        .filter(|dim| bit(16 + *dim as u32))
        .collect::<Vec<_>>();
    let slice_sizes = (0..rank)
        .map(|dim| {
            if collapsed_slice_dims.contains(&dim) {
                1
            } else {
                1 + ((bits >> (24 + 4 * dim)) as usize % operand[dim])
            }
        })
        .collect::<Vec<_>>();

    let window_rank = rank - collapsed_slice_dims.len();
    let first_offset = (bits >> 56) as usize % (batch.len() + 1);
    let offset_dims = (first_offset..first_offset + window_rank).collect::<Vec<_>>();

    let (indices, index_vector_dim) = if implicit {
        (batch.clone(), batch.len())
    } else {
        let ivd = (bits >> 60) as usize % (batch.len() + 1);
        let mut dims = batch.clone();
        dims.insert(ivd, start_index_map.len());
        (dims, ivd)
    };

    GatherCase::f32(
        &operand,
        &indices,
        &offset_dims,
        &collapsed_slice_dims,
        &start_index_map,
        index_vector_dim,
        &slice_sizes,
    )
}

fn gather_case() -> impl Strategy<Value = GatherCase> {
    (
        prop::collection::vec(1usize..=4, 1..=3),
        prop::collection::vec(0usize..=3, 0..=2),
        any::<u64>(),
        any::<bool>(),
    )
        .prop_map(|(operand, batch, bits, implicit)| build_case(operand, batch, bits, implicit))
}

fn ones(dims: &[usize]) -> usize {
    dims.iter().filter(|dim| **dim == 1).count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn eliminate_all_removes_gathers_and_keeps_output_type(case in gather_case()) {
        let mut program = case.program();
        let before = result_type(&program).clone();

        let changed = GatherExpander::with_mode(GatherExpanderMode::EliminateAllGathers)
            .run_on_program(&mut program)
            .expect("valid gathers expand");

        prop_assert!(changed);
        prop_assert_eq!(count_ops(&program, is_gather), 0);
        prop_assert_eq!(result_type(&program), &before);
        prop_assert!(verify_program(&program).is_ok(), "{}", program.to_text());
    }

    #[test]
    fn loop_state_adds_no_degenerate_dims(case in gather_case()) {
        let mut program = case.program();
        GatherExpander::with_mode(GatherExpanderMode::EliminateAllGathers)
            .run_on_program(&mut program)
            .expect("valid gathers expand");

        let loops = program.functions[0]
            .body
            .iter()
            .filter(|inst| is_while(&inst.op))
            .collect::<Vec<_>>();
        prop_assert!(loops.len() <= 1);
        if let Some(while_inst) = loops.first() {
            let dims = carried_dims(while_inst);
            let window = case
                .slice_sizes
                .iter()
                .enumerate()
                .filter(|(dim, _)| !case.collapsed_slice_dims.contains(dim))
                .map(|(_, size)| *size)
                .collect::<Vec<_>>();
            prop_assert!(dims[0].is_empty());
            prop_assert_eq!(&dims[1], &case.operand);
            prop_assert!(dims[2][0] > 1);
            prop_assert!(ones(&dims[2]) <= ones(&case.indices));
            prop_assert_eq!(&dims[3][1..], window.as_slice());
            prop_assert!(dims[3][0] > 1);
        }
    }

    #[test]
    fn simple_mode_keeps_exactly_the_general_gathers(case in gather_case()) {
        let desc = GatherDescriptor::new(
            ValueId(0),
            &case.operand_type(),
            &case.indices_type(),
            &case.spec(),
            &case.program().functions[0].results[0],
        )
        .expect("generated gathers are well formed");
        let simple = classify(&desc).is_simple();

        let mut program = case.program();
        let changed = GatherExpander::with_mode(GatherExpanderMode::EliminateSimpleGathers)
            .run_on_program(&mut program)
            .expect("simple mode never fails on valid gathers");

        prop_assert_eq!(changed, simple);
        prop_assert_eq!(count_ops(&program, is_while), 0);
        prop_assert_eq!(count_ops(&program, is_gather), usize::from(!simple));
        prop_assert!(program
            .functions[0]
            .body
            .iter()
            .all(|inst| !matches!(inst.op, Operation::While(_))));
    }
}
