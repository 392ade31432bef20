#![allow(dead_code)]

use ptir_gather::backend::{
    builder::GraphBuilder,
    ptir_utils::value_type_static,
    spec::{
        DType, GatherDimensionNumbers, GatherSpec, Instruction, OpMetadata, Operation, Program,
        ValueType,
    },
};

/// Describes one gather for the helpers below.
#[derive(Debug, Clone)]
pub struct GatherCase {
    pub dtype: DType,
    pub operand: Vec<usize>,
    pub index_dtype: DType,
    pub indices: Vec<usize>,
    pub offset_dims: Vec<usize>,
    pub collapsed_slice_dims: Vec<usize>,
    pub start_index_map: Vec<usize>,
    pub index_vector_dim: usize,
    pub slice_sizes: Vec<usize>,
}

impl GatherCase {
    pub fn f32(
        operand: &[usize],
        indices: &[usize],
        offset_dims: &[usize],
        collapsed_slice_dims: &[usize],
        start_index_map: &[usize],
        index_vector_dim: usize,
        slice_sizes: &[usize],
    ) -> Self {
        Self {
            dtype: DType::F32,
            operand: operand.to_vec(),
            index_dtype: DType::Si32,
            indices: indices.to_vec(),
            offset_dims: offset_dims.to_vec(),
            collapsed_slice_dims: collapsed_slice_dims.to_vec(),
            start_index_map: start_index_map.to_vec(),
            index_vector_dim,
            slice_sizes: slice_sizes.to_vec(),
        }
    }

    pub fn spec(&self) -> GatherSpec {
        GatherSpec {
            dimension_numbers: GatherDimensionNumbers {
                offset_dims: self.offset_dims.clone(),
                collapsed_slice_dims: self.collapsed_slice_dims.clone(),
                start_index_map: self.start_index_map.clone(),
                index_vector_dim: self.index_vector_dim,
            },
            slice_sizes: self.slice_sizes.clone(),
        }
    }

    pub fn operand_type(&self) -> ValueType {
        value_type_static(self.dtype, &self.operand)
    }

    pub fn indices_type(&self) -> ValueType {
        value_type_static(self.index_dtype, &self.indices)
    }

    /// Program `@main(operand, indices) -> gather(operand, indices)`.
    pub fn program(&self) -> Program {
        self.program_with_metadata(None)
    }

    pub fn program_with_metadata(&self, metadata: Option<OpMetadata>) -> Program {
        let mut builder = GraphBuilder::new();
        let operand = builder.add_parameter(self.operand_type());
        let indices = builder.add_parameter(self.indices_type());
        let gather = builder
            .emit(
                Operation::Gather(self.spec()),
                vec![operand.into(), indices.into()],
            )
            .expect("gather case must type-check");
        if let Some(metadata) = metadata {
            builder.set_metadata(gather, metadata);
        }
        let function = builder
            .finish_function("main", vec![gather])
            .expect("finish function");
        Program::new("main").with_functions(vec![function])
    }
}

/// Routes pass logs to the test harness so failures show the rewrite trace.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn sample_metadata() -> OpMetadata {
    OpMetadata {
        op_type: "Gather".to_string(),
        op_name: "embedding/lookup".to_string(),
        source_file: "model.py".to_string(),
        source_line: 42,
    }
}

/// Every instruction in the program, functions first.
pub fn all_instructions(program: &Program) -> Vec<&Instruction> {
    program
        .functions
        .iter()
        .flat_map(|function| function.body.iter())
        .chain(program.regions.iter().flat_map(|region| region.body.iter()))
        .collect()
}

pub fn count_ops(program: &Program, pred: impl Fn(&Operation) -> bool) -> usize {
    all_instructions(program)
        .into_iter()
        .filter(|inst| pred(&inst.op))
        .count()
}

pub fn is_gather(op: &Operation) -> bool {
    matches!(op, Operation::Gather(_))
}

pub fn is_while(op: &Operation) -> bool {
    matches!(op, Operation::While(_))
}

pub fn is_broadcast(op: &Operation) -> bool {
    matches!(op, Operation::BroadcastTo(_))
}

/// Static dims of every element carried by the tuple a `while` yields.
pub fn carried_dims(instruction: &Instruction) -> Vec<Vec<usize>> {
    let ValueType::Tuple(elements) = &instruction.output else {
        panic!("while must yield a tuple");
    };
    elements
        .iter()
        .map(|element| {
            element
                .as_tensor()
                .and_then(|spec| spec.shape.static_dims())
                .expect("carried values are static tensors")
        })
        .collect()
}

pub fn result_type(program: &Program) -> &ValueType {
    &program.functions[0].results[0]
}

pub fn result_producer(program: &Program) -> &Instruction {
    let function = &program.functions[0];
    let result = function.result_ids[0];
    function
        .body
        .iter()
        .find(|inst| inst.id == result)
        .expect("result must be produced by an instruction")
}
