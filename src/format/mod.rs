//! Output format module implementation

mod csv;
mod json;

pub use self::csv::*;
pub use self::json::*;

use crate::{Analysis, AnalysisError, BasicBlock, SymbolicValue};
use clap::ValueEnum;
use std::fmt;
use std::str::FromStr;

/// Supported output formats for analysis results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    Text,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one JSON object per line)
    JsonLines,
    /// CSV format (comma-separated values)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get the default output format
    pub fn default() -> Self {
        OutputFormat::Text
    }

    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Text,
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
        ]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn AnalysisFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for analysis output
pub trait AnalysisFormatter {
    /// Format an analysis result labeled with the analyzed function's name
    fn format(&self, analysis: &Analysis, label: &str) -> Result<String, AnalysisError>;
}

/// Format analysis results in plain text
pub struct TextFormatter;

/// Format analysis results in JSON
pub struct JsonFormatter;

/// Format analysis results in JSON Lines
pub struct JsonLinesFormatter;

/// Format analysis results in CSV
pub struct CsvFormatter;

/// Render an operand stack bottom-to-top as `[a, b]`.
pub(crate) fn format_stack(stack: &[SymbolicValue]) -> String {
    let rendered: Vec<String> = stack.iter().map(ToString::to_string).collect();
    format!("[{}]", rendered.join(", "))
}

/// One `target [label]` description per successor, in edge order.
pub(crate) fn edge_descriptions(block: &BasicBlock) -> Vec<String> {
    block
        .successors
        .iter()
        .map(|target| {
            match block.edge_to(*target).and_then(|kind| kind.label()) {
                Some(label) => format!("{} [{}]", target, label),
                None => target.to_string(),
            }
        })
        .collect()
}

impl AnalysisFormatter for TextFormatter {
    fn format(&self, analysis: &Analysis, label: &str) -> Result<String, AnalysisError> {
        let mut output = String::new();

        match analysis {
            Analysis::Cfg(graph) => {
                output.push_str(&format!("Control flow graph: {}\n\n", label));

                for block in graph.blocks.values() {
                    output.push_str(&format!(
                        "Block {} (offsets {}..{}):\n",
                        block.start_offset, block.start_offset, block.end_offset
                    ));

                    for instruction in &block.instructions {
                        output
                            .push_str(&format!("  {:>4}  {}\n", instruction.offset, instruction));
                    }

                    // Format successors
                    if block.successors.is_empty() {
                        output.push_str("  No successors (terminal block)\n");
                    } else {
                        output.push_str("  Successors: ");
                        for (i, description) in edge_descriptions(block).iter().enumerate() {
                            if i > 0 {
                                output.push_str(", ");
                            }
                            output.push_str(description);
                        }
                        output.push('\n');
                    }

                    output.push('\n');
                }
            }
            Analysis::Trace(trace) => {
                output.push_str(&format!("Bytecode trace: {}\n\n", label));
                output.push_str(&format!(
                    "{:<7} {:<22} {:<15} {:<30} {}\n",
                    "Offset", "Opcode", "Arg", "Stack Before", "Stack After"
                ));

                for step in &trace.steps {
                    output.push_str(&format!(
                        "{:<7} {:<22} {:<15} {:<30} {}\n",
                        step.offset,
                        step.opcode,
                        step.operand_display,
                        format_stack(&step.stack_before),
                        format_stack(&step.stack_after)
                    ));
                }

                if let Some(locals) = trace.final_locals() {
                    if !locals.is_empty() {
                        output.push_str("\nFinal locals:\n");
                        for (name, value) in locals {
                            output.push_str(&format!("  {} = {}\n", name, value));
                        }
                    }
                }
            }
        }

        Ok(output)
    }
}
