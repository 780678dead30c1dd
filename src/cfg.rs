//! Basic-block partitioning and control-flow graph construction.
//!
//! Blocks split at jump targets and at the instruction following a branch.
//! Edges come from the last instruction of each block: a branch contributes
//! its taken edge (plus a labeled fall-through when conditional), returns
//! and raises contribute none, and every other block falls through to the
//! next block in offset order.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use rayon::prelude::*;

use crate::{AnalysisError, BasicBlock, ControlFlowGraph, EdgeKind, Instruction, Offset};

/// Build the control-flow graph of one instruction sequence.
///
/// The sequence must be in decode order. An empty sequence yields an empty
/// graph; a jump whose target matches no instruction offset is a
/// [`AnalysisError::DecodeInconsistency`].
pub fn build(instructions: &[Instruction]) -> Result<ControlFlowGraph, AnalysisError> {
    if instructions.is_empty() {
        return Ok(ControlFlowGraph::default());
    }

    let offsets: BTreeSet<Offset> = instructions.iter().map(|i| i.offset).collect();
    let starts = block_starts(instructions, &offsets)?;
    debug!(
        "identified {} block starts across {} instructions",
        starts.len(),
        instructions.len()
    );

    let mut blocks = partition(instructions, &starts);
    connect(&mut blocks);
    debug!(
        "control flow graph has {} blocks and {} edges",
        blocks.len(),
        blocks.values().map(|b| b.successors.len()).sum::<usize>()
    );

    Ok(ControlFlowGraph { blocks })
}

/// Build control-flow graphs for a batch of instruction sequences in
/// parallel. Results keep the input order; the first decode inconsistency
/// fails the whole batch.
pub fn build_all(functions: &[Vec<Instruction>]) -> Result<Vec<ControlFlowGraph>, AnalysisError> {
    functions
        .par_iter()
        .map(|instructions| build(instructions))
        .collect()
}

/// Offsets where a new block begins: the first instruction, every jump
/// target, and every instruction following a branch.
fn block_starts(
    instructions: &[Instruction],
    offsets: &BTreeSet<Offset>,
) -> Result<BTreeSet<Offset>, AnalysisError> {
    let mut starts = BTreeSet::new();
    starts.insert(instructions[0].offset);

    for (index, instruction) in instructions.iter().enumerate() {
        if !instruction.opcode.is_branch() {
            continue;
        }
        if let Some(target) = instruction.jump_target() {
            if !offsets.contains(&target) {
                return Err(AnalysisError::DecodeInconsistency {
                    offset: instruction.offset,
                    target,
                });
            }
            starts.insert(target);
        }
        if let Some(next) = instructions.get(index + 1) {
            starts.insert(next.offset);
        }
    }

    Ok(starts)
}

/// Split the sequence into blocks at the given start offsets.
fn partition(
    instructions: &[Instruction],
    starts: &BTreeSet<Offset>,
) -> BTreeMap<Offset, BasicBlock> {
    let mut blocks = BTreeMap::new();
    let mut current = BasicBlock::new(instructions[0].offset);

    for instruction in instructions {
        if instruction.offset != current.start_offset && starts.contains(&instruction.offset) {
            blocks.insert(current.start_offset, current);
            current = BasicBlock::new(instruction.offset);
        }
        current.add_instruction(instruction.clone());
    }
    blocks.insert(current.start_offset, current);

    blocks
}

/// Derive the edges of every block from its last instruction.
fn connect(blocks: &mut BTreeMap<Offset, BasicBlock>) {
    let ordered: Vec<Offset> = blocks.keys().copied().collect();
    let mut edges: Vec<(Offset, Offset, EdgeKind)> = Vec::new();

    for (index, &start) in ordered.iter().enumerate() {
        let block = &blocks[&start];
        let last = match block.last_instruction() {
            Some(last) => last,
            None => continue,
        };
        let next_start = ordered.get(index + 1).copied();

        if last.opcode.is_branch() {
            let labels = last.opcode.branch_labels();
            // The taken edge needs a decoded target; the fall-through of a
            // conditional ending exists either way.
            if let Some(target) = last.jump_target() {
                match labels {
                    Some((taken, _)) => edges.push((start, target, EdgeKind::conditional(taken))),
                    None => edges.push((start, target, EdgeKind::Unconditional)),
                }
            }
            if let (Some((_, fall)), Some(next)) = (labels, next_start) {
                edges.push((start, next, EdgeKind::conditional(fall)));
            }
        } else if !last.opcode.is_terminal() {
            if let Some(next) = next_start {
                edges.push((start, next, EdgeKind::Unconditional));
            }
        }
    }

    for (from, to, kind) in edges {
        if let Some(block) = blocks.get_mut(&from) {
            block.add_successor(to, kind);
        }
    }
}
