mod gather_support;

use gather_support::{
    all_instructions, carried_dims, count_ops, init_tracing, is_broadcast, is_gather, is_while,
    result_producer, result_type, sample_metadata, GatherCase,
};
use ptir_gather::backend::{
    builder::GraphBuilder,
    optimizer::{FunctionPass, PassContext},
    ptir_utils::value_type_static,
    spec::{DType, Operation, Program, RegionId},
};
use ptir_gather::{verify_program, GatherExpander, GatherExpanderMode, PassError};

fn expand_all(program: &mut Program) -> Result<bool, PassError> {
    GatherExpander::with_mode(GatherExpanderMode::EliminateAllGathers).run_on_program(program)
}

fn expand_simple(program: &mut Program) -> Result<bool, PassError> {
    GatherExpander::with_mode(GatherExpanderMode::EliminateSimpleGathers).run_on_program(program)
}

fn scenario_a() -> GatherCase {
    GatherCase::f32(&[3, 3], &[2], &[0], &[1], &[1], 1, &[3, 1])
}

#[test]
fn general_gather_becomes_single_loop_without_degenerate_state() {
    init_tracing();
    let mut program = scenario_a().program();
    let before = result_type(&program).clone();

    assert!(expand_all(&mut program).expect("expansion succeeds"));

    assert_eq!(count_ops(&program, is_gather), 0);
    assert_eq!(count_ops(&program, is_while), 1);
    assert_eq!(program.regions.len(), 2);
    assert_eq!(result_type(&program), &before);
    assert_eq!(before, value_type_static(DType::F32, &[3, 2]));

    let while_inst = all_instructions(&program)
        .into_iter()
        .find(|inst| is_while(&inst.op))
        .expect("loop present");
    let dims = carried_dims(while_inst);
    assert_eq!(dims[0], Vec::<usize>::new(), "counter is a scalar");
    assert_eq!(&dims[1..], &[vec![3, 3], vec![2], vec![2, 3]]);

    verify_program(&program).expect("expanded program verifies");
}

#[test]
fn loop_regions_test_counter_and_write_accumulator() {
    let mut program = scenario_a().program();
    expand_all(&mut program).expect("expansion succeeds");

    let while_inst = all_instructions(&program)
        .into_iter()
        .find(|inst| is_while(&inst.op))
        .expect("loop present");
    let Operation::While(spec) = &while_inst.op else {
        unreachable!();
    };
    let cond = program.region(spec.cond_region).expect("cond region");
    let body = program.region(spec.body_region).expect("body region");

    assert_eq!(cond.results, vec![value_type_static(DType::I1, &[])]);
    assert!(cond
        .body
        .iter()
        .any(|inst| matches!(inst.op, Operation::Compare(_))));
    assert_eq!(body.parameters, body.results);
    assert_eq!(body.result_ids[1], body.parameter_ids[1], "operand passes through");
    assert_eq!(body.result_ids[2], body.parameter_ids[2], "indices pass through");
    assert!(body
        .body
        .iter()
        .any(|inst| matches!(inst.op, Operation::DynamicUpdateSlice(_))));
}

#[test]
fn simple_mode_rewrites_single_index_gather_without_loop() {
    let case = GatherCase::f32(&[100], &[1], &[0], &[], &[0], 0, &[10]);
    let mut program = case.program();

    assert!(expand_simple(&mut program).expect("expansion succeeds"));

    assert_eq!(count_ops(&program, is_gather), 0);
    assert_eq!(count_ops(&program, is_while), 0);
    assert!(program.regions.is_empty());
    assert_eq!(result_type(&program), &value_type_static(DType::F32, &[10]));
    assert!(matches!(
        result_producer(&program).op,
        Operation::DynamicSlice(_)
    ));
    verify_program(&program).expect("expanded program verifies");
}

#[test]
fn simple_mode_rewrites_degenerate_index_gather_as_broadcast() {
    let case = GatherCase::f32(&[1, 3], &[7, 5], &[1], &[0], &[0], 2, &[1, 3]);
    let mut program = case.program();

    assert!(expand_simple(&mut program).expect("expansion succeeds"));

    assert_eq!(count_ops(&program, is_gather), 0);
    assert_eq!(count_ops(&program, is_while), 0);
    assert!(count_ops(&program, is_broadcast) >= 1);
    assert_eq!(
        result_type(&program),
        &value_type_static(DType::F32, &[7, 3, 5])
    );
    verify_program(&program).expect("expanded program verifies");
}

#[test]
fn simple_mode_leaves_general_gather_unchanged() {
    let case = GatherCase::f32(&[3, 3], &[2], &[1], &[0], &[0], 1, &[1, 3]);
    let mut program = case.program();
    let original = program.clone();

    assert!(!expand_simple(&mut program).expect("pass runs"));
    assert_eq!(program, original);
}

#[test]
fn oversized_gather_fails_and_leaves_graph_untouched() {
    init_tracing();
    let case = GatherCase::f32(&[3, 3], &[2147483647, 5], &[2], &[0], &[0], 2, &[1, 3]);
    let mut program = case.program();
    let original = program.clone();

    let err = expand_all(&mut program).expect_err("trip count exceeds bound");
    assert!(err.is_unsupported_size());
    let message = err.to_string();
    assert!(message.contains("2147483647"), "{message}");
    assert!(message.contains("10737418235"), "{message}");
    assert_eq!(program, original);
}

#[test]
fn oversized_gather_fails_in_simple_mode_too() {
    let case = GatherCase::f32(&[3, 3], &[2147483647, 5], &[2], &[0], &[0], 2, &[1, 3]);
    let mut program = case.program();
    let err = expand_simple(&mut program).expect_err("size is validated before classifying");
    assert!(matches!(err, PassError::UnsupportedSize { .. }));
}

#[test]
fn loop_root_carries_gather_metadata() {
    let mut program = scenario_a().program_with_metadata(Some(sample_metadata()));
    expand_all(&mut program).expect("expansion succeeds");

    let with_metadata = all_instructions(&program)
        .into_iter()
        .filter(|inst| inst.metadata.is_some())
        .collect::<Vec<_>>();
    assert_eq!(with_metadata.len(), 1, "only the loop inherits provenance");
    assert!(is_while(&with_metadata[0].op));
    assert_eq!(with_metadata[0].metadata, Some(sample_metadata()));
}

#[test]
fn slice_root_carries_gather_metadata() {
    let case = GatherCase::f32(&[100], &[1], &[0], &[], &[0], 0, &[10]);
    let mut program = case.program_with_metadata(Some(sample_metadata()));
    expand_simple(&mut program).expect("expansion succeeds");

    assert_eq!(result_producer(&program).metadata, Some(sample_metadata()));
}

#[test]
fn empty_gather_becomes_empty_constant() {
    let case = GatherCase::f32(&[4, 3], &[0], &[1], &[0], &[0], 1, &[1, 3]);
    let mut program = case.program();

    assert!(expand_simple(&mut program).expect("expansion succeeds"));

    let producer = result_producer(&program);
    let Operation::Constant(literal) = &producer.op else {
        panic!("expected constant, got {:?}", producer.op);
    };
    assert_eq!(literal.byte_len(), 0);
    assert_eq!(result_type(&program), &value_type_static(DType::F32, &[0, 3]));
    verify_program(&program).expect("expanded program verifies");
}

#[test]
fn two_gathers_get_independent_loops() {
    let case = scenario_a();
    let mut builder = GraphBuilder::new();
    let operand = builder.add_parameter(case.operand_type());
    let indices = builder.add_parameter(case.indices_type());
    let first = builder
        .emit(
            Operation::Gather(case.spec()),
            vec![operand.into(), indices.into()],
        )
        .expect("first gather");
    let second = builder
        .emit(
            Operation::Gather(case.spec()),
            vec![operand.into(), indices.into()],
        )
        .expect("second gather");
    let function = builder
        .finish_function("main", vec![first, second])
        .expect("finish");
    let mut program = Program::new("main").with_functions(vec![function]);

    assert!(expand_all(&mut program).expect("expansion succeeds"));

    assert_eq!(count_ops(&program, is_gather), 0);
    assert_eq!(count_ops(&program, is_while), 2);
    let mut ids = program
        .regions
        .iter()
        .map(|region| region.id)
        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4, "each loop owns a fresh cond/body pair");
    verify_program(&program).expect("expanded program verifies");
}

#[test]
fn explicit_index_vector_not_last_is_moved_before_flattening() {
    // indices [2, 4, 3] with the index vector in the middle: 6 index vectors of length 4.
    let case = GatherCase::f32(
        &[5, 6, 7, 8],
        &[2, 4, 3],
        &[2],
        &[0, 1, 2],
        &[0, 1, 2, 3],
        1,
        &[1, 1, 1, 8],
    );
    let mut program = case.program();
    assert_eq!(result_type(&program), &value_type_static(DType::F32, &[2, 3, 8]));

    assert!(expand_all(&mut program).expect("expansion succeeds"));

    let while_inst = all_instructions(&program)
        .into_iter()
        .find(|inst| is_while(&inst.op))
        .expect("loop present");
    let dims = carried_dims(while_inst);
    assert_eq!(dims[2], vec![6, 4]);
    assert_eq!(dims[3], vec![6, 8]);
    assert!(count_ops(&program, |op| matches!(op, Operation::Transpose(_))) >= 1);
    verify_program(&program).expect("expanded program verifies");
}

#[test]
fn gathers_inside_regions_are_expanded() {
    let case = GatherCase::f32(&[100], &[1], &[0], &[], &[0], 0, &[10]);
    let mut region_builder = GraphBuilder::new();
    let operand = region_builder.add_parameter(case.operand_type());
    let indices = region_builder.add_parameter(case.indices_type());
    let gathered = region_builder
        .emit(
            Operation::Gather(case.spec()),
            vec![operand.into(), indices.into()],
        )
        .expect("gather");
    let region = region_builder
        .finish_region(RegionId(0), vec![gathered])
        .expect("region");

    let mut main = GraphBuilder::new();
    let x = main.add_parameter(case.operand_type());
    let function = main.finish_function("main", vec![x]).expect("main");
    let mut program = Program::new("main")
        .with_functions(vec![function])
        .with_regions(vec![region]);

    assert!(expand_simple(&mut program).expect("expansion succeeds"));
    assert_eq!(count_ops(&program, is_gather), 0);
    assert_eq!(program.regions.len(), 1);
}

#[test]
fn function_pass_reports_statistics() {
    init_tracing();
    let mut program = scenario_a().program();
    let mut cx = PassContext::for_program(&program);
    let pass = GatherExpander::default();

    let stats = pass
        .run(&mut program.functions[0], &mut cx)
        .expect("expansion succeeds");

    assert!(stats.changed);
    assert_eq!(stats.rewrites_applied, 1);
    assert_eq!(stats.regions_added, 2);
    assert!(stats.erased_insts >= 1);
    assert_eq!(cx.new_regions().len(), 2);
    assert_eq!(pass.name(), "gather-expander");
}

#[test]
fn malformed_declared_output_is_rejected() {
    let mut program = scenario_a().program();
    program.functions[0].body[0].output = value_type_static(DType::F32, &[2, 3]);
    program.functions[0].results[0] = value_type_static(DType::F32, &[2, 3]);
    let original = program.clone();

    let err = expand_all(&mut program).expect_err("declared output is wrong");
    assert!(matches!(err, PassError::MalformedDescriptor { .. }));
    assert!(!err.is_unsupported_size());
    assert_eq!(program, original);
}
