//! JSON and JSON Lines output formatters

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{edge_descriptions, AnalysisFormatter};
use crate::{
    Analysis, AnalysisError, BasicBlock, ControlFlowGraph, ExecutionStep, Instruction, Offset,
};

/// Serializable instruction for JSON output
#[derive(Serialize, Deserialize)]
struct InstructionJson {
    /// Offset of the instruction within the function
    offset: Offset,
    /// Opcode name
    opcode: String,
    /// Raw operand, when the instruction carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    arg: Option<u32>,
    /// Operand display text
    operand: String,
}

/// Serializable control-flow edge for JSON output
#[derive(Serialize, Deserialize)]
struct EdgeJson {
    /// Identifier of the successor block
    block: usize,
    /// Start offset of the successor block
    target: Offset,
    /// Whether the edge depends on the branch outcome
    conditional: bool,
    /// Label of a conditional edge
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

/// Serializable basic block for JSON output
#[derive(Serialize, Deserialize)]
struct BlockJson {
    /// Block identifier, counting blocks in start-offset order
    id: usize,
    /// Offset of the first instruction
    start_offset: Offset,
    /// Offset of the last instruction
    end_offset: Offset,
    /// Instructions in this block
    instructions: Vec<InstructionJson>,
    /// Outgoing edges
    successors: Vec<EdgeJson>,
}

/// Serializable execution step for JSON output
#[derive(Serialize, Deserialize)]
struct StepJson {
    /// Position of the step within the trace
    step: usize,
    /// Offset of the instruction
    offset: Offset,
    /// Opcode name
    opcode: String,
    /// Operand display text
    operand: String,
    /// Operand stack before the instruction, bottom to top
    stack_before: Vec<String>,
    /// Operand stack after the instruction, bottom to top
    stack_after: Vec<String>,
    /// Local bindings after the instruction
    locals: BTreeMap<String, String>,
}

/// Serializable analysis result for JSON output
#[derive(Serialize, Deserialize)]
struct AnalysisJson {
    /// Name of the analyzed function
    label: String,
    /// Type of analysis ("cfg" or "trace")
    #[serde(rename = "type")]
    analysis_type: String,
    /// Identifier of the entry block (for control-flow graphs)
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<usize>,
    /// Basic blocks (for control-flow graphs)
    #[serde(skip_serializing_if = "Option::is_none")]
    blocks: Option<Vec<BlockJson>>,
    /// Execution steps (for traces)
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<Vec<StepJson>>,
}

impl AnalysisFormatter for super::JsonFormatter {
    fn format(&self, analysis: &Analysis, label: &str) -> Result<String, AnalysisError> {
        let result = match analysis {
            Analysis::Cfg(graph) => {
                let ids = block_ids(graph);
                let blocks = graph
                    .blocks
                    .values()
                    .map(|block| block_to_json(block, &ids))
                    .collect();

                AnalysisJson {
                    label: label.to_string(),
                    analysis_type: "cfg".to_string(),
                    entry: graph.entry_offset().and_then(|start| ids.get(&start).copied()),
                    blocks: Some(blocks),
                    steps: None,
                }
            }
            Analysis::Trace(trace) => {
                let steps = trace
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(index, step)| step_to_json(index, step))
                    .collect();

                AnalysisJson {
                    label: label.to_string(),
                    analysis_type: "trace".to_string(),
                    entry: None,
                    blocks: None,
                    steps: Some(steps),
                }
            }
        };

        serde_json::to_string_pretty(&result)
            .map_err(|e| AnalysisError::Serialization(format!("JSON serialization error: {}", e)))
    }
}

impl AnalysisFormatter for super::JsonLinesFormatter {
    fn format(&self, analysis: &Analysis, label: &str) -> Result<String, AnalysisError> {
        let mut output = String::new();

        match analysis {
            Analysis::Cfg(graph) => {
                let ids = block_ids(graph);
                for block in graph.blocks.values() {
                    let block_json = json!({
                        "type": "block",
                        "label": label,
                        "id": ids[&block.start_offset],
                        "start_offset": block.start_offset,
                        "end_offset": block.end_offset,
                        "successors": edge_descriptions(block),
                    });

                    output.push_str(&serde_json::to_string(&block_json).map_err(|e| {
                        AnalysisError::Serialization(format!("JSON serialization error: {}", e))
                    })?);
                    output.push('\n');

                    // Then output instructions for this block
                    for instruction in &block.instructions {
                        let instruction_json = json!({
                            "type": "instruction",
                            "label": label,
                            "block": ids[&block.start_offset],
                            "offset": instruction.offset,
                            "opcode": instruction.opcode.name(),
                            "operand": instruction.operand_display(),
                        });

                        output.push_str(&serde_json::to_string(&instruction_json).map_err(
                            |e| {
                                AnalysisError::Serialization(format!(
                                    "JSON serialization error: {}",
                                    e
                                ))
                            },
                        )?);
                        output.push('\n');
                    }
                }
            }
            Analysis::Trace(trace) => {
                for (index, step) in trace.steps.iter().enumerate() {
                    let step_json = json!({
                        "type": "step",
                        "label": label,
                        "step": index,
                        "offset": step.offset,
                        "opcode": step.opcode,
                        "operand": step.operand_display,
                        "stack_before": rendered_stack(&step.stack_before),
                        "stack_after": rendered_stack(&step.stack_after),
                        "locals": step
                            .locals
                            .iter()
                            .map(|(name, value)| (name.clone(), value.to_string()))
                            .collect::<BTreeMap<String, String>>(),
                    });

                    output.push_str(&serde_json::to_string(&step_json).map_err(|e| {
                        AnalysisError::Serialization(format!("JSON serialization error: {}", e))
                    })?);
                    output.push('\n');
                }
            }
        }

        Ok(output)
    }
}

/// Block identifiers in ascending start-offset order.
fn block_ids(graph: &ControlFlowGraph) -> BTreeMap<Offset, usize> {
    graph
        .blocks
        .keys()
        .enumerate()
        .map(|(id, &start)| (start, id))
        .collect()
}

/// Convert an instruction to JSON format
fn instruction_to_json(instruction: &Instruction) -> InstructionJson {
    InstructionJson {
        offset: instruction.offset,
        opcode: instruction.opcode.name().to_string(),
        arg: instruction.arg,
        operand: instruction.operand_display(),
    }
}

/// Convert a basic block to JSON format
fn block_to_json(block: &BasicBlock, ids: &BTreeMap<Offset, usize>) -> BlockJson {
    let successors = block
        .successors
        .iter()
        .map(|&target| {
            let kind = block.edge_to(target);
            EdgeJson {
                block: ids.get(&target).copied().unwrap_or_default(),
                target,
                conditional: kind.map_or(false, |kind| kind.is_conditional()),
                label: kind.and_then(|kind| kind.label()).map(str::to_string),
            }
        })
        .collect();

    BlockJson {
        id: ids.get(&block.start_offset).copied().unwrap_or_default(),
        start_offset: block.start_offset,
        end_offset: block.end_offset,
        instructions: block.instructions.iter().map(instruction_to_json).collect(),
        successors,
    }
}

/// Convert an execution step to JSON format
fn step_to_json(index: usize, step: &ExecutionStep) -> StepJson {
    StepJson {
        step: index,
        offset: step.offset,
        opcode: step.opcode.clone(),
        operand: step.operand_display.clone(),
        stack_before: rendered_stack(&step.stack_before),
        stack_after: rendered_stack(&step.stack_after),
        locals: step
            .locals
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect(),
    }
}

/// Stack values as display strings, bottom to top.
fn rendered_stack(stack: &[crate::SymbolicValue]) -> Vec<String> {
    stack.iter().map(ToString::to_string).collect()
}
