use std::{fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Frozen PTIR specification version enforced by this interface.
pub const SPEC_VERSION: &str = "ptir.v0.4";

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// Enumerates scalar element types supported by the PTIR contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si4,
    Ui4,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    Fp8E4M3,
    Fp8E5M2,
    Bf16,
    F16,
    F32,
    F64,
}

impl DType {
    /// Returns `true` when the dtype is any signed or unsigned integer, including quantized 4-bit types.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::Si4
                | DType::Ui4
                | DType::Si8
                | DType::Ui8
                | DType::Si16
                | DType::Ui16
                | DType::Si32
                | DType::Ui32
                | DType::Si64
                | DType::Ui64
        )
    }

    /// Returns the storage bit-width of the logical scalar.
    pub fn bitwidth(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si4 | DType::Ui4 => 4,
            DType::Si8 | DType::Ui8 | DType::Fp8E4M3 | DType::Fp8E5M2 => 8,
            DType::Si16 | DType::Ui16 | DType::Bf16 | DType::F16 => 16,
            DType::Si32 | DType::Ui32 | DType::F32 => 32,
            DType::Si64 | DType::Ui64 | DType::F64 => 64,
        }
    }

    /// Returns the size in bytes of one unpacked scalar (sub-byte types round up).
    pub fn scalar_byte_len(self) -> usize {
        self.bitwidth().div_ceil(8)
    }
}

/// Names a symbolic dynamic dimension (e.g. `?B`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Returns total element count when shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Returns total byte length when the shape is static.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.scalar_byte_len())
    }
}

/// Dense literal tensor payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Comparator used by the `compare` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
}

/// Elementwise binary ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

/// Attribute payload for `compare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareSpec {
    pub op: ComparisonOp,
}

/// Entry in the requested output shape for `reshape`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReshapeDim {
    Explicit(Dimension),
    Infer,
}

/// Attribute payload for `reshape`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Vec<ReshapeDim>,
}

/// Permutation payload for `transpose`. Output axis `i` reads input axis `perm[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Attribute payload for `broadcast_to`. Follows trailing-axis (numpy) alignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastToSpec {
    pub result_shape: Shape,
}

/// Attribute payload for `slice`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub starts: Vec<usize>,
    pub sizes: Vec<usize>,
}

/// Attribute payload for `concat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: isize,
}

/// Dimension numbers describing a generalized `gather`.
///
/// `offset_dims` are the output axes fed by the read window, `collapsed_slice_dims` are operand
/// axes of extent 1 dropped from the window, `start_index_map[k]` names the operand axis indexed
/// by component `k` of an index vector, and `index_vector_dim` is the indices axis holding those
/// components (equal to the indices rank when the vector is implicit).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatherDimensionNumbers {
    pub offset_dims: Vec<usize>,
    pub collapsed_slice_dims: Vec<usize>,
    pub start_index_map: Vec<usize>,
    pub index_vector_dim: usize,
}

/// Attribute payload for `gather`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatherSpec {
    pub dimension_numbers: GatherDimensionNumbers,
    pub slice_sizes: Vec<usize>,
}

/// Attribute payload for `dynamic_slice`. Operands are `(input, starts)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicSliceSpec {
    pub sizes: Vec<usize>,
}

/// Attribute payload for `dynamic_update_slice`. Operands are `(base, update, starts)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicUpdateSliceSpec {
    pub sizes: Vec<usize>,
}

/// Identifies a region referenced by control-flow ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub usize);

/// Control-flow payload for `while`.
///
/// Operands are the initial carried values; the instruction yields a tuple of the final carries.
/// `cond_region` maps the carries to one `i1` scalar, `body_region` maps them to the next carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhileSpec {
    pub cond_region: RegionId,
    pub body_region: RegionId,
}

/// Unique identifier for SSA values in a PTIR computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Typing information for SSA values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Tuple(Vec<ValueType>),
}

impl ValueType {
    pub fn as_tensor(&self) -> Option<&TensorSpec> {
        match self {
            ValueType::Tensor(spec) => Some(spec),
            ValueType::Tuple(_) => None,
        }
    }
}

/// Operand reference in an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    TupleElement { tuple: ValueId, index: usize },
    Literal(TensorLiteral),
}

impl Operand {
    /// Returns the SSA value this operand reads, if any.
    pub fn value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(value) => Some(*value),
            Operand::TupleElement { tuple, .. } => Some(*tuple),
            Operand::Literal(_) => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(value: ValueId) -> Self {
        Operand::Value(value)
    }
}

/// Declarative form of PTIR operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseBinary(ElementwiseBinaryOp),
    Compare(CompareSpec),
    Reshape(ReshapeSpec),
    Transpose(TransposeSpec),
    BroadcastTo(BroadcastToSpec),
    Slice(SliceSpec),
    Concat(ConcatSpec),
    Gather(GatherSpec),
    DynamicSlice(DynamicSliceSpec),
    DynamicUpdateSlice(DynamicUpdateSliceSpec),
    While(WhileSpec),
}

impl Operation {
    /// Short mnemonic used in logs and textual dumps.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::ElementwiseBinary(_) => "elementwise_binary",
            Operation::Compare(_) => "compare",
            Operation::Reshape(_) => "reshape",
            Operation::Transpose(_) => "transpose",
            Operation::BroadcastTo(_) => "broadcast_to",
            Operation::Slice(_) => "slice",
            Operation::Concat(_) => "concat",
            Operation::Gather(_) => "gather",
            Operation::DynamicSlice(_) => "dynamic_slice",
            Operation::DynamicUpdateSlice(_) => "dynamic_update_slice",
            Operation::While(_) => "while",
        }
    }
}

/// Source attribution attached to an instruction by the frontend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpMetadata {
    #[serde(default)]
    pub op_type: String,
    #[serde(default)]
    pub op_name: String,
    #[serde(default)]
    pub source_file: String,
    #[serde(default)]
    pub source_line: u32,
}

/// Single SSA instruction in the declarative PTIR program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<OpMetadata>,
}

impl Instruction {
    pub fn new(id: ValueId, op: Operation, operands: Vec<Operand>, output: ValueType) -> Self {
        Self {
            id,
            op,
            operands,
            output,
            metadata: None,
        }
    }
}

/// Region used by control-flow constructs. Regions have their own value namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub parameters: Vec<ValueType>,
    pub parameter_ids: Vec<ValueId>,
    pub body: Vec<Instruction>,
    pub results: Vec<ValueType>,
    pub result_ids: Vec<ValueId>,
}

/// PTIR function describing a reusable computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<ValueType>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<ValueType>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
}

/// Uniform view over the bodies passes rewrite: functions and control-flow regions.
pub trait Computation {
    /// Human-readable name used in diagnostics (`@main`, `^r3`).
    fn label(&self) -> String;
    fn parameter_ids(&self) -> &[ValueId];
    fn parameters(&self) -> &[ValueType];
    fn body(&self) -> &[Instruction];
    fn body_mut(&mut self) -> &mut Vec<Instruction>;
    fn result_ids(&self) -> &[ValueId];
    fn result_ids_mut(&mut self) -> &mut Vec<ValueId>;
    fn results(&self) -> &[ValueType];
}

impl Computation for Function {
    fn label(&self) -> String {
        format!("@{}", self.name)
    }

    fn parameter_ids(&self) -> &[ValueId] {
        &self.parameter_ids
    }

    fn parameters(&self) -> &[ValueType] {
        &self.parameters
    }

    fn body(&self) -> &[Instruction] {
        &self.body
    }

    fn body_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.body
    }

    fn result_ids(&self) -> &[ValueId] {
        &self.result_ids
    }

    fn result_ids_mut(&mut self) -> &mut Vec<ValueId> {
        &mut self.result_ids
    }

    fn results(&self) -> &[ValueType] {
        &self.results
    }
}

impl Computation for Region {
    fn label(&self) -> String {
        format!("^r{}", self.id.0)
    }

    fn parameter_ids(&self) -> &[ValueId] {
        &self.parameter_ids
    }

    fn parameters(&self) -> &[ValueType] {
        &self.parameters
    }

    fn body(&self) -> &[Instruction] {
        &self.body
    }

    fn body_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.body
    }

    fn result_ids(&self) -> &[ValueId] {
        &self.result_ids
    }

    fn result_ids_mut(&mut self) -> &mut Vec<ValueId> {
        &mut self.result_ids
    }

    fn results(&self) -> &[ValueType] {
        &self.results
    }
}

/// Complete PTIR module with helper regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    pub entry: String,
    pub functions: Vec<Function>,
    pub regions: Vec<Region>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("program spec version '{found}' does not match expected '{expected}'")]
    SpecVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
            regions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.function(&self.entry)
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.iter().find(|region| region.id == id)
    }

    /// Returns the smallest region id greater than every id already in use.
    pub fn next_region_id(&self) -> RegionId {
        RegionId(
            self.regions
                .iter()
                .map(|region| region.id.0 + 1)
                .max()
                .unwrap_or(0),
        )
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = serde_json::from_str(src).map_err(ProgramSerdeError::from)?;
        program.spec_version = normalize_spec_version(program.spec_version)?;
        Ok(program)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_spec_version(version: String) -> Result<String, ProgramSerdeError> {
    if version.is_empty() {
        return Ok(SPEC_VERSION.to_string());
    }
    if version == SPEC_VERSION {
        Ok(version)
    } else {
        Err(ProgramSerdeError::SpecVersionMismatch {
            found: version,
            expected: SPEC_VERSION,
        })
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(
            f,
            0,
            &format!(
                "program @{} (spec_version = {}) {{",
                self.entry, self.spec_version
            ),
        )?;
        for function in &self.functions {
            fmt_computation(&format!("func @{}", function.name), function, 1, f)?;
        }
        for region in &self.regions {
            fmt_computation(&format!("region ^r{}", region.id.0), region, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_computation(
    header: &str,
    computation: &dyn Computation,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    write_line(f, indent, &format!("{header} {{"))?;
    if !computation.parameter_ids().is_empty() {
        write_line(f, indent + 1, "params:")?;
        for (value_id, value_type) in computation
            .parameter_ids()
            .iter()
            .zip(computation.parameters().iter())
        {
            write_line(
                f,
                indent + 2,
                &format!("%{} : {}", value_id.0, format_value_type(value_type)),
            )?;
        }
    }
    if !computation.body().is_empty() {
        write_line(f, indent + 1, "body:")?;
        for instruction in computation.body() {
            fmt_instruction(instruction, indent + 2, f)?;
        }
    }
    if !computation.result_ids().is_empty() {
        write_line(f, indent + 1, "results:")?;
        for (value_id, value_type) in computation
            .result_ids()
            .iter()
            .zip(computation.results().iter())
        {
            write_line(
                f,
                indent + 2,
                &format!("%{} : {}", value_id.0, format_value_type(value_type)),
            )?;
        }
    }
    write_line(f, indent, "}")
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(format_operand)
        .collect::<Vec<_>>()
        .join(", ");
    let op_repr = match &instruction.op {
        Operation::Constant(literal) => format!(
            "constant<{:?} x {}>",
            literal.spec.dtype,
            format_shape(&literal.spec.shape)
        ),
        other => format!("{other:?}"),
    };
    let mut line = if operands.is_empty() {
        format!(
            "%{} = {} -> {}",
            instruction.id.0,
            op_repr,
            format_value_type(&instruction.output)
        )
    } else {
        format!(
            "%{} = {}({}) -> {}",
            instruction.id.0,
            op_repr,
            operands,
            format_value_type(&instruction.output)
        )
    };
    if let Some(metadata) = &instruction.metadata {
        line.push_str(&format!(
            " {{op_type={:?}, op_name={:?}}}",
            metadata.op_type, metadata.op_name
        ));
    }
    write_line(f, indent, &line)
}

pub(crate) fn format_value_type(value_type: &ValueType) -> String {
    match value_type {
        ValueType::Tensor(spec) => {
            format!("tensor<{:?} x {}>", spec.dtype, format_shape(&spec.shape))
        }
        ValueType::Tuple(elements) => {
            let inner = elements
                .iter()
                .map(format_value_type)
                .collect::<Vec<_>>()
                .join(", ");
            format!("tuple<{}>", inner)
        }
    }
}

pub(crate) fn format_shape(shape: &Shape) -> String {
    let dims = shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => v.to_string(),
            Dimension::Dynamic(sym) => format!("?{}", sym.as_str()),
        })
        .collect::<Vec<_>>();
    if dims.is_empty() {
        "[]".to_string()
    } else {
        dims.join("x")
    }
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::Value(id) => format!("%{}", id.0),
        Operand::TupleElement { tuple, index } => format!("%{}[{}]", tuple.0, index),
        Operand::Literal(lit) => format!(
            "literal(dtype={:?}, shape={})",
            lit.spec.dtype,
            format_shape(&lit.spec.shape)
        ),
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}
