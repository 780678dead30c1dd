//! CSV output formatter

use csv::WriterBuilder;

use super::{edge_descriptions, format_stack, AnalysisFormatter};
use crate::{Analysis, AnalysisError};

impl AnalysisFormatter for super::CsvFormatter {
    fn format(&self, analysis: &Analysis, label: &str) -> Result<String, AnalysisError> {
        let mut writer = WriterBuilder::new().from_writer(vec![]);

        match analysis {
            Analysis::Cfg(graph) => {
                writer
                    .write_record([
                        "label",
                        "block",
                        "offset",
                        "opcode",
                        "arg",
                        "operand",
                        "successors",
                    ])
                    .map_err(csv_error)?;

                for block in graph.blocks.values() {
                    let block_id = block.start_offset.to_string();
                    let successors = edge_descriptions(block).join("; ");

                    for instruction in &block.instructions {
                        let offset = instruction.offset.to_string();
                        let arg = instruction.arg.map(|a| a.to_string()).unwrap_or_default();
                        let operand = instruction.operand_display();

                        writer
                            .write_record([
                                label,
                                block_id.as_str(),
                                offset.as_str(),
                                instruction.opcode.name(),
                                arg.as_str(),
                                operand.as_str(),
                                successors.as_str(),
                            ])
                            .map_err(csv_error)?;
                    }
                }
            }
            Analysis::Trace(trace) => {
                writer
                    .write_record([
                        "label",
                        "step",
                        "offset",
                        "opcode",
                        "operand",
                        "stack_before",
                        "stack_after",
                        "locals",
                    ])
                    .map_err(csv_error)?;

                for (index, step) in trace.steps.iter().enumerate() {
                    let step_id = index.to_string();
                    let offset = step.offset.to_string();
                    let stack_before = format_stack(&step.stack_before);
                    let stack_after = format_stack(&step.stack_after);
                    let locals = step
                        .locals
                        .iter()
                        .map(|(name, value)| format!("{}={}", name, value))
                        .collect::<Vec<_>>()
                        .join("; ");

                    writer
                        .write_record([
                            label,
                            step_id.as_str(),
                            offset.as_str(),
                            step.opcode.as_str(),
                            step.operand_display.as_str(),
                            stack_before.as_str(),
                            stack_after.as_str(),
                            locals.as_str(),
                        ])
                        .map_err(csv_error)?;
                }
            }
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| AnalysisError::Serialization(format!("CSV serialization error: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| AnalysisError::Serialization(format!("CSV serialization error: {}", e)))
    }
}

/// Map a CSV writer error into the analysis error type
fn csv_error(error: csv::Error) -> AnalysisError {
    AnalysisError::Serialization(format!("CSV serialization error: {}", error))
}
