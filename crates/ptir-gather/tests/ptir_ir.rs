mod gather_support;

use gather_support::{sample_metadata, GatherCase};
use ptir_gather::backend::spec::{Program, ProgramSerdeError, SPEC_VERSION};
use ptir_gather::GatherExpander;

/// Column gather from a 3x3 matrix, expanded into a loop with two regions.
fn expanded_program() -> Program {
    let mut program = GatherCase::f32(&[3, 3], &[2], &[0], &[1], &[1], 1, &[3, 1])
        .program_with_metadata(Some(sample_metadata()));
    GatherExpander::default()
        .run_on_program(&mut program)
        .expect("expansion succeeds");
    program
}

#[test]
fn program_display_renders_loop_and_regions() {
    let rendered = expanded_program().to_text();
    assert!(
        rendered.contains("program @main"),
        "rendered IR missing program header:\n{rendered}"
    );
    assert!(
        rendered.contains("region ^r0") && rendered.contains("region ^r1"),
        "rendered IR missing loop regions:\n{rendered}"
    );
    assert!(
        rendered.contains("While(WhileSpec"),
        "rendered IR missing loop:\n{rendered}"
    );
    assert!(
        rendered.contains("op_name=\"embedding/lookup\""),
        "rendered IR missing provenance:\n{rendered}"
    );
    assert!(
        rendered.contains("tensor<F32 x 3x2>"),
        "rendered IR missing result type:\n{rendered}"
    );
}

#[test]
fn program_json_roundtrip_preserves_expanded_structure() {
    let program = expanded_program();
    let json = program.to_json_string().expect("json serialization");
    let parsed = Program::from_json_str(&json).expect("json deserialization");
    assert_eq!(parsed, program);
}

#[test]
fn program_json_missing_spec_version_defaults() {
    let program = expanded_program();
    let mut value = serde_json::to_value(&program).expect("serialize to json value");
    value
        .as_object_mut()
        .expect("json object")
        .remove("spec_version");
    let json = serde_json::to_string_pretty(&value).expect("encode json");
    let parsed = Program::from_json_str(&json).expect("parsed without spec version");
    assert_eq!(parsed.spec_version, SPEC_VERSION);
}

#[test]
fn program_json_spec_version_mismatch_errors() {
    let program = expanded_program();
    let mut value = serde_json::to_value(&program).expect("serialize to json value");
    value["spec_version"] = serde_json::Value::String("ptir.v999".to_string());
    let json = serde_json::to_string_pretty(&value).expect("encode json");
    let err = Program::from_json_str(&json).expect_err("expected spec version mismatch");
    match err {
        ProgramSerdeError::SpecVersionMismatch { found, expected } => {
            assert_eq!(found, "ptir.v999");
            assert_eq!(expected, SPEC_VERSION);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
