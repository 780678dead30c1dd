//! Python bindings for the stackflow analyzer

use std::collections::BTreeMap;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::format::{AnalysisFormatter, OutputFormat};
use crate::{
    cfg, trace, Analysis, CallArgs, FunctionMetadata, Instruction, NoStackEffects, Offset, Opcode,
    Operand, Scalar, StackEffect, StackEffectSource, SymbolicValue,
};

/// Build and format the control-flow graph of an instruction sequence
#[pyfunction]
#[pyo3(signature = (
    instructions,
    label="<function>",
    output_format="text"
))]
fn analyze_cfg(
    instructions: &Bound<'_, PyAny>,
    label: &str,
    output_format: &str,
) -> PyResult<String> {
    let decoded = instructions_from_py(instructions)?;

    let graph = cfg::build(&decoded)
        .map_err(|e| PyValueError::new_err(format!("Control flow analysis failed: {}", e)))?;

    let output_format: OutputFormat = output_format.parse().map_err(PyValueError::new_err)?;
    let formatter = output_format.get_formatter();

    formatter
        .format(&Analysis::Cfg(graph), label)
        .map_err(|e| PyValueError::new_err(format!("Failed to format output: {}", e)))
}

/// Simulate and format the symbolic stack trace of an instruction sequence
#[pyfunction]
#[pyo3(signature = (
    instructions,
    params=Vec::new(),
    args=None,
    kwargs=None,
    defaults=None,
    stack_effects=None,
    label="<function>",
    output_format="text"
))]
fn analyze_trace(
    instructions: &Bound<'_, PyAny>,
    params: Vec<String>,
    args: Option<&Bound<'_, PyAny>>,
    kwargs: Option<&Bound<'_, PyDict>>,
    defaults: Option<&Bound<'_, PyDict>>,
    stack_effects: Option<Py<PyAny>>,
    label: &str,
    output_format: &str,
) -> PyResult<String> {
    let decoded = instructions_from_py(instructions)?;

    let mut metadata = FunctionMetadata {
        params,
        defaults: BTreeMap::new(),
    };
    if let Some(defaults) = defaults {
        for (name, value) in defaults.iter() {
            metadata
                .defaults
                .insert(name.extract()?, value_from_py(&value));
        }
    }

    let mut call_args = CallArgs::default();
    if let Some(args) = args {
        for value in args.try_iter()? {
            call_args.positional.push(value_from_py(&value?));
        }
    }
    if let Some(kwargs) = kwargs {
        for (name, value) in kwargs.iter() {
            call_args
                .keyword
                .insert(name.extract()?, value_from_py(&value));
        }
    }

    let trace = match stack_effects {
        Some(callback) => trace::run(
            &decoded,
            &metadata,
            &call_args,
            &PyStackEffects { callback },
        ),
        None => trace::run(&decoded, &metadata, &call_args, &NoStackEffects),
    };

    let output_format: OutputFormat = output_format.parse().map_err(PyValueError::new_err)?;
    let formatter = output_format.get_formatter();

    formatter
        .format(&Analysis::Trace(trace), label)
        .map_err(|e| PyValueError::new_err(format!("Failed to format output: {}", e)))
}

/// Stack-effect lookup backed by a Python callable.
///
/// The callable receives `(opname, arg)` and returns a `(pops, pushes)`
/// pair; anything else makes the lookup silently report no information.
/// `dis.stack_effect` wrapped in a small shim is the intended source.
struct PyStackEffects {
    callback: Py<PyAny>,
}

impl StackEffectSource for PyStackEffects {
    fn stack_effect(&self, opcode: &Opcode, arg: Option<u32>) -> Option<StackEffect> {
        Python::with_gil(|py| {
            let result = self.callback.call1(py, (opcode.name(), arg)).ok()?;
            let (pops, pushes): (usize, usize) = result.extract(py).ok()?;
            Some(StackEffect { pops, pushes })
        })
    }
}

/// Collect decoded instruction records from any Python iterable.
fn instructions_from_py(instructions: &Bound<'_, PyAny>) -> PyResult<Vec<Instruction>> {
    let mut decoded = Vec::new();
    for record in instructions.try_iter()? {
        decoded.push(instruction_from_py(&record?)?);
    }
    Ok(decoded)
}

/// Convert one decoded instruction record into the analyzer's form.
///
/// Any object shaped like `dis.Instruction` works: only the `offset`,
/// `opname`, `arg`, `argval`, and `argrepr` attributes are read.
fn instruction_from_py(record: &Bound<'_, PyAny>) -> PyResult<Instruction> {
    let offset: Offset = record.getattr("offset")?.extract()?;
    let opname: String = record.getattr("opname")?.extract()?;
    let arg: Option<u32> = record.getattr("arg")?.extract()?;
    let opcode = Opcode::from_name(&opname);

    let argval = record.getattr("argval")?;
    let argrepr: String = record.getattr("argrepr")?.extract().unwrap_or_default();
    let operand = operand_from_py(&opcode, arg, &argval, &argrepr)?;

    Ok(Instruction::new(offset, opcode, arg, operand))
}

/// Resolve a decoded operand into the analyzer's form.
///
/// Branch instructions carry their target offset; name and operator
/// opcodes keep their text; everything else becomes a constant when the
/// value is scalar, or falls back to the decoder's display text.
fn operand_from_py(
    opcode: &Opcode,
    arg: Option<u32>,
    argval: &Bound<'_, PyAny>,
    argrepr: &str,
) -> PyResult<Option<Operand>> {
    if argval.is_none() {
        // A constant load of the none value also decodes with an empty
        // argval; the raw operand tells the two cases apart
        if *opcode == Opcode::LoadConst && arg.is_some() {
            return Ok(Some(Operand::none()));
        }
        return Ok(None);
    }

    if opcode.is_branch() {
        if let Ok(target) = argval.extract::<Offset>() {
            return Ok(Some(Operand::Target(target)));
        }
    }

    // Booleans are a subtype of integers and must be probed first
    if let Ok(value) = argval.extract::<bool>() {
        return Ok(Some(Operand::Const(Scalar::Bool(value))));
    }
    if let Ok(value) = argval.extract::<i64>() {
        return Ok(Some(Operand::Const(Scalar::Int(value))));
    }
    if let Ok(value) = argval.extract::<f64>() {
        return Ok(Some(Operand::Const(Scalar::Float(value))));
    }
    if let Ok(value) = argval.extract::<String>() {
        if is_name_opcode(opcode) {
            return Ok(Some(Operand::Name(value)));
        }
        if is_operator_opcode(opcode) {
            return Ok(Some(Operand::Text(value)));
        }
        return Ok(Some(Operand::Const(Scalar::Str(value))));
    }

    // Tuples and anything richer keep their display text
    if argrepr.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Operand::Text(argrepr.to_string())))
    }
}

/// Convert a Python argument value into a symbolic value.
fn value_from_py(value: &Bound<'_, PyAny>) -> SymbolicValue {
    if value.is_none() {
        return SymbolicValue::none();
    }
    if let Ok(v) = value.extract::<bool>() {
        return SymbolicValue::boolean(v);
    }
    if let Ok(v) = value.extract::<i64>() {
        return SymbolicValue::int(v);
    }
    if let Ok(v) = value.extract::<f64>() {
        return SymbolicValue::float(v);
    }
    if let Ok(v) = value.extract::<String>() {
        return SymbolicValue::str(&v);
    }
    SymbolicValue::placeholder(&format!("<{}>", value))
}

fn is_name_opcode(opcode: &Opcode) -> bool {
    matches!(
        opcode,
        Opcode::LoadFast
            | Opcode::LoadName
            | Opcode::LoadGlobal
            | Opcode::StoreFast
            | Opcode::StoreName
    )
}

fn is_operator_opcode(opcode: &Opcode) -> bool {
    matches!(
        opcode,
        Opcode::BinaryOp | Opcode::CompareOp | Opcode::ContainsOp | Opcode::IsOp
    )
}

/// Python module initialization
#[pymodule]
fn stackflow(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Add module level functions
    m.add_function(wrap_pyfunction!(analyze_cfg, m)?)?;
    m.add_function(wrap_pyfunction!(analyze_trace, m)?)?;

    // Create the OutputFormat class as a dict
    let py = m.py();
    let output_format = PyDict::new_bound(py);
    output_format.set_item("TEXT", "text")?;
    output_format.set_item("JSON", "json")?;
    output_format.set_item("JSONL", "jsonl")?;
    output_format.set_item("CSV", "csv")?;
    m.setattr("OutputFormat", output_format)?;

    Ok(())
}
