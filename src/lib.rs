//! Core IR, traits, and errors for the stackflow bytecode analyzer.
//!
//! This library analyzes the decoded instruction sequence of a compiled
//! function and produces two artifacts: a control-flow graph of basic blocks
//! with classified edges, and a step-by-step symbolic trace of the operand
//! stack and local variables. Decoding itself is an external concern; any
//! decoder that yields `Instruction` records (CPython's `dis` module being
//! the usual source) can drive the analyzer.
//!
//! # Basic Usage
//!
//! ```rust
//! use stackflow::{
//!     cfg, trace, CallArgs, FunctionMetadata, Instruction, NoStackEffects, Opcode, Operand,
//!     SymbolicValue,
//! };
//!
//! // abs(x), laid out the way CPython 3.13 decodes it
//! let instructions = vec![
//!     Instruction::new(0, Opcode::Resume, Some(0), None),
//!     Instruction::new(2, Opcode::LoadFast, Some(0), Some(Operand::name("x"))),
//!     Instruction::new(4, Opcode::LoadConst, Some(1), Some(Operand::int(0))),
//!     Instruction::new(6, Opcode::CompareOp, Some(68), Some(Operand::text(">"))),
//!     Instruction::new(10, Opcode::PopJumpIfFalse, Some(2), Some(Operand::target(16))),
//!     Instruction::new(12, Opcode::LoadFast, Some(0), Some(Operand::name("x"))),
//!     Instruction::new(14, Opcode::ReturnValue, None, None),
//!     Instruction::new(16, Opcode::LoadFast, Some(0), Some(Operand::name("x"))),
//!     Instruction::new(18, Opcode::UnaryNegative, None, None),
//!     Instruction::new(20, Opcode::ReturnValue, None, None),
//! ];
//!
//! // Control-flow graph with classified edges
//! let graph = cfg::build(&instructions).unwrap();
//! assert_eq!(graph.block_count(), 3);
//! assert_eq!(graph.entry_offset(), Some(0));
//!
//! // Symbolic trace of the same stream with x = 5
//! let metadata = FunctionMetadata::with_params(&["x"]);
//! let args = CallArgs::positional(vec![SymbolicValue::int(5)]);
//! let trace = trace::run(&instructions, &metadata, &args, &NoStackEffects);
//! assert_eq!(trace.steps.len(), 7);
//! ```

pub mod cfg;
pub mod format;
pub mod opcode;
pub mod trace;
mod large_tests;
#[cfg(feature = "extension-module")]
pub mod python;

pub use opcode::Opcode;

use std::collections::BTreeMap;
use std::fmt;

/// Byte offset of an instruction inside its function.
pub type Offset = u32;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Offset of the instruction within the function
    pub offset: Offset,
    /// Opcode category
    pub opcode: Opcode,
    /// Raw operand as encoded in the stream
    pub arg: Option<u32>,
    /// Resolved operand (jump target, constant, name)
    pub argval: Option<Operand>,
}

impl Instruction {
    /// Create a new instruction record.
    pub fn new(offset: Offset, opcode: Opcode, arg: Option<u32>, argval: Option<Operand>) -> Self {
        Self {
            offset,
            opcode,
            arg,
            argval,
        }
    }

    /// Resolved jump target, when the operand carries one.
    pub fn jump_target(&self) -> Option<Offset> {
        match self.argval {
            Some(Operand::Target(target)) => Some(target),
            _ => None,
        }
    }

    /// Resolved name operand, when the operand carries one.
    pub fn name(&self) -> Option<&str> {
        match &self.argval {
            Some(Operand::Name(name)) => Some(name),
            _ => None,
        }
    }

    /// Operand rendered the way a disassembly listing annotates it.
    ///
    /// Jump targets render as `to N`; global loads whose low operand bit
    /// requests the null receiver marker get a ` + NULL` suffix.
    pub fn operand_display(&self) -> String {
        let text = match &self.argval {
            Some(Operand::Target(target)) => format!("to {}", target),
            Some(Operand::Const(scalar)) => scalar.to_string(),
            Some(Operand::Name(name)) => name.clone(),
            Some(Operand::Text(text)) => text.clone(),
            None => String::new(),
        };
        if self.opcode == Opcode::LoadGlobal && self.arg.map_or(false, |arg| arg & 1 == 1) {
            format!("{} + NULL", text)
        } else {
            text
        }
    }

    /// True when the resolved operand is just the raw operand again, in
    /// which case display skips the parenthesized form.
    fn argval_echoes_arg(&self) -> bool {
        match (&self.argval, self.arg) {
            (Some(Operand::Const(Scalar::Int(v))), Some(arg)) => {
                *v >= 0 && *v as u64 == arg as u64
            }
            (Some(Operand::Const(Scalar::Float(v))), Some(arg)) => *v == arg as f64,
            (Some(Operand::Target(target)), Some(arg)) => *target == arg,
            _ => false,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.name())?;
        if let Some(arg) = self.arg {
            write!(f, " {}", arg)?;
        }
        if let Some(argval) = &self.argval {
            if !self.argval_echoes_arg() {
                match argval {
                    Operand::Target(target) => write!(f, " ({})", target)?,
                    Operand::Const(Scalar::Str(s)) => {
                        write!(f, " ({})", truncated_repr(&format!("'{}'", s)))?
                    }
                    Operand::Const(scalar) => write!(f, " ({})", scalar)?,
                    Operand::Name(name) => {
                        write!(f, " ({})", truncated_repr(&format!("'{}'", name)))?
                    }
                    Operand::Text(text) => {
                        write!(f, " ({})", truncated_repr(&format!("'{}'", text)))?
                    }
                }
            }
        }
        Ok(())
    }
}

/// String operands longer than 20 characters are cut to 17 plus an ellipsis.
fn truncated_repr(repr: &str) -> String {
    if repr.chars().count() > 20 {
        let head: String = repr.chars().take(17).collect();
        format!("{}...", head)
    } else {
        repr.to_string()
    }
}

/// Resolved operand of an instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Jump target offset
    Target(Offset),
    /// Constant value
    Const(Scalar),
    /// Variable, global, or attribute name
    Name(String),
    /// Anything else, kept as display text (operator symbols, fused name
    /// lists)
    Text(String),
}

impl Operand {
    /// Integer constant operand.
    pub fn int(value: i64) -> Self {
        Operand::Const(Scalar::Int(value))
    }

    /// Float constant operand.
    pub fn float(value: f64) -> Self {
        Operand::Const(Scalar::Float(value))
    }

    /// String constant operand.
    pub fn str(value: &str) -> Self {
        Operand::Const(Scalar::Str(value.to_string()))
    }

    /// None constant operand.
    pub fn none() -> Self {
        Operand::Const(Scalar::None)
    }

    /// Name operand.
    pub fn name(name: &str) -> Self {
        Operand::Name(name.to_string())
    }

    /// Free-text operand.
    pub fn text(text: &str) -> Self {
        Operand::Text(text.to_string())
    }

    /// Jump target operand.
    pub fn target(target: Offset) -> Self {
        Operand::Target(target)
    }
}

/// Concrete scalar tracked by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// The source language's none/nil value
    None,
    /// Call-convention marker for "no bound receiver"
    Null,
}

impl Scalar {
    /// Truth value under the source language's rules, when decidable.
    pub fn truthiness(&self) -> Option<bool> {
        match self {
            Scalar::Int(v) => Some(*v != 0),
            Scalar::Float(v) => Some(*v != 0.0),
            Scalar::Bool(v) => Some(*v),
            Scalar::Str(s) => Some(!s.is_empty()),
            Scalar::None => Some(false),
            Scalar::Null => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            // Integral floats keep their trailing .0, matching the source
            // language's repr
            Scalar::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Scalar::Bool(true) => write!(f, "True"),
            Scalar::Bool(false) => write!(f, "False"),
            Scalar::Str(s) => write!(f, "'{}'", s),
            Scalar::None => write!(f, "None"),
            Scalar::Null => write!(f, "NULL"),
        }
    }
}

/// Abstract value on the simulated operand stack.
///
/// Either a concrete scalar (when folding succeeded), a placeholder tag
/// carrying display text, or a composite built from other symbolic values.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolicValue {
    Concrete(Scalar),
    Placeholder(String),
    List(Vec<SymbolicValue>),
    Tuple(Vec<SymbolicValue>),
    Map(Vec<(SymbolicValue, SymbolicValue)>),
}

impl SymbolicValue {
    /// Concrete integer.
    pub fn int(value: i64) -> Self {
        SymbolicValue::Concrete(Scalar::Int(value))
    }

    /// Concrete float.
    pub fn float(value: f64) -> Self {
        SymbolicValue::Concrete(Scalar::Float(value))
    }

    /// Concrete boolean.
    pub fn boolean(value: bool) -> Self {
        SymbolicValue::Concrete(Scalar::Bool(value))
    }

    /// Concrete string.
    pub fn str(value: &str) -> Self {
        SymbolicValue::Concrete(Scalar::Str(value.to_string()))
    }

    /// The none value.
    pub fn none() -> Self {
        SymbolicValue::Concrete(Scalar::None)
    }

    /// The null receiver marker.
    pub fn null() -> Self {
        SymbolicValue::Concrete(Scalar::Null)
    }

    /// Placeholder with display text.
    pub fn placeholder(text: &str) -> Self {
        SymbolicValue::Placeholder(text.to_string())
    }

    /// True for the null receiver marker.
    pub fn is_null(&self) -> bool {
        matches!(self, SymbolicValue::Concrete(Scalar::Null))
    }

    /// Concrete scalar, when this value holds one.
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            SymbolicValue::Concrete(scalar) => Some(scalar),
            _ => None,
        }
    }
}

impl fmt::Display for SymbolicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolicValue::Concrete(scalar) => write!(f, "{}", scalar),
            SymbolicValue::Placeholder(text) => write!(f, "{}", text),
            SymbolicValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            SymbolicValue::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                // Singleton tuples keep the trailing comma
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            SymbolicValue::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Kind of a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Fall-through or unconditional jump
    Unconditional,
    /// Branch-taken or branch-not-taken path, with its presentation label
    Conditional { label: &'static str },
}

impl EdgeKind {
    /// Conditional edge with the given label.
    pub const fn conditional(label: &'static str) -> Self {
        EdgeKind::Conditional { label }
    }

    /// True for conditional edges.
    pub const fn is_conditional(&self) -> bool {
        matches!(self, EdgeKind::Conditional { .. })
    }

    /// Presentation label, when the edge carries one.
    pub const fn label(&self) -> Option<&'static str> {
        match self {
            EdgeKind::Conditional { label } => Some(label),
            EdgeKind::Unconditional => None,
        }
    }
}

/// One basic block: a maximal straight-line instruction run.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    /// Offset of the first instruction
    pub start_offset: Offset,
    /// Offset of the last instruction
    pub end_offset: Offset,
    /// Instructions in decode order
    pub instructions: Vec<Instruction>,
    /// Successor block start offsets, in insertion order
    pub successors: Vec<Offset>,
    /// Edge classification per successor
    pub edge_kind: BTreeMap<Offset, EdgeKind>,
}

impl BasicBlock {
    /// Create an empty block starting at `start_offset`.
    pub fn new(start_offset: Offset) -> Self {
        Self {
            start_offset,
            end_offset: start_offset,
            instructions: Vec::new(),
            successors: Vec::new(),
            edge_kind: BTreeMap::new(),
        }
    }

    /// Append an instruction, keeping `end_offset` current.
    pub fn add_instruction(&mut self, instruction: Instruction) {
        self.end_offset = instruction.offset;
        self.instructions.push(instruction);
    }

    /// Record an edge to `target`. Duplicate targets are ignored.
    pub fn add_successor(&mut self, target: Offset, kind: EdgeKind) {
        if !self.successors.contains(&target) {
            self.successors.push(target);
            self.edge_kind.insert(target, kind);
        }
    }

    /// Last instruction of the block.
    pub fn last_instruction(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Edge classification toward `target`, when such an edge exists.
    pub fn edge_to(&self, target: Offset) -> Option<EdgeKind> {
        self.edge_kind.get(&target).copied()
    }

    /// Number of instructions in the block.
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }
}

/// Control-flow graph of one function.
///
/// Blocks are keyed by start offset; the entry block is the lowest one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControlFlowGraph {
    pub blocks: BTreeMap<Offset, BasicBlock>,
}

impl ControlFlowGraph {
    /// Start offset of the entry block.
    pub fn entry_offset(&self) -> Option<Offset> {
        self.blocks.keys().next().copied()
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total number of instructions across all blocks.
    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.instructions.len()).sum()
    }

    /// True when the graph has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks with no successors.
    pub fn exit_blocks(&self) -> Vec<&BasicBlock> {
        self.blocks
            .values()
            .filter(|b| b.successors.is_empty())
            .collect()
    }
}

/// State transition recorded for one simulated instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStep {
    /// Offset of the instruction
    pub offset: Offset,
    /// Opcode name
    pub opcode: String,
    /// Operand as display text
    pub operand_display: String,
    /// Operand stack before the instruction
    pub stack_before: Vec<SymbolicValue>,
    /// Operand stack after the instruction
    pub stack_after: Vec<SymbolicValue>,
    /// Local bindings after the instruction
    pub locals: BTreeMap<String, SymbolicValue>,
}

impl ExecutionStep {
    /// Net stack effect observed for this step.
    pub fn net_effect(&self) -> isize {
        self.stack_after.len() as isize - self.stack_before.len() as isize
    }
}

/// Ordered symbolic execution trace of one function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trace {
    pub steps: Vec<ExecutionStep>,
}

impl Trace {
    /// Number of recorded steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// True when nothing was simulated.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Local bindings after the last simulated instruction.
    pub fn final_locals(&self) -> Option<&BTreeMap<String, SymbolicValue>> {
        self.steps.last().map(|step| &step.locals)
    }

    /// Operand stack after the last simulated instruction.
    pub fn final_stack(&self) -> Option<&[SymbolicValue]> {
        self.steps.last().map(|step| step.stack_after.as_slice())
    }

    /// Deepest operand stack observed during the run.
    pub fn max_stack_depth(&self) -> usize {
        self.steps
            .iter()
            .map(|step| step.stack_after.len())
            .max()
            .unwrap_or(0)
    }
}

/// Declared parameters of the simulated callable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionMetadata {
    /// Parameter names in declaration order
    pub params: Vec<String>,
    /// Default values keyed by parameter name
    pub defaults: BTreeMap<String, SymbolicValue>,
}

impl FunctionMetadata {
    /// Metadata with the given parameter names and no defaults.
    pub fn with_params(names: &[&str]) -> Self {
        Self {
            params: names.iter().map(|n| n.to_string()).collect(),
            defaults: BTreeMap::new(),
        }
    }
}

/// Arguments supplied for one simulation run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallArgs {
    /// Positional argument values
    pub positional: Vec<SymbolicValue>,
    /// Keyword argument values
    pub keyword: BTreeMap<String, SymbolicValue>,
}

impl CallArgs {
    /// Positional arguments only.
    pub fn positional(values: Vec<SymbolicValue>) -> Self {
        Self {
            positional: values,
            keyword: BTreeMap::new(),
        }
    }
}

/// Net stack behavior of an opcode outside the explicit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEffect {
    /// Values consumed from the stack
    pub pops: usize,
    /// Values produced onto the stack
    pub pushes: usize,
}

/// Fallback stack-effect lookup for opcodes the simulator does not model.
///
/// The decoding collaborator usually backs this with the runtime's own
/// effect table (CPython's `dis.stack_effect`).
pub trait StackEffectSource: Send + Sync {
    /// Stack effect of `opcode` with raw operand `arg`, when known.
    fn stack_effect(&self, opcode: &Opcode, arg: Option<u32>) -> Option<StackEffect>;
}

/// Lookup with no information; unknown opcodes become no-ops.
pub struct NoStackEffects;

impl StackEffectSource for NoStackEffects {
    fn stack_effect(&self, _opcode: &Opcode, _arg: Option<u32>) -> Option<StackEffect> {
        None
    }
}

/// Unified analysis output handed to the formatters.
#[derive(Debug, Clone)]
pub enum Analysis {
    /// Control-flow graph of basic blocks
    Cfg(ControlFlowGraph),
    /// Symbolic execution trace
    Trace(Trace),
}

impl Analysis {
    /// Number of instructions covered by the analysis.
    pub fn instruction_count(&self) -> usize {
        match self {
            Analysis::Cfg(graph) => graph.instruction_count(),
            Analysis::Trace(trace) => trace.steps.len(),
        }
    }

    /// True when the analysis covers nothing.
    pub fn is_empty(&self) -> bool {
        self.instruction_count() == 0
    }
}

impl From<ControlFlowGraph> for Analysis {
    fn from(graph: ControlFlowGraph) -> Self {
        Analysis::Cfg(graph)
    }
}

impl From<Trace> for Analysis {
    fn from(trace: Trace) -> Self {
        Analysis::Trace(trace)
    }
}

/// Error type for analysis operations
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// A jump targets an offset with no matching instruction
    #[error("jump at offset {offset} targets offset {target}, which has no instruction")]
    DecodeInconsistency { offset: Offset, target: Offset },

    /// Formatter output could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
