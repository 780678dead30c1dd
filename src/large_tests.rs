#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Instant;

    use crate::{
        cfg,
        format::OutputFormat,
        trace, Analysis, AnalysisError, CallArgs, EdgeKind, FunctionMetadata, Instruction,
        NoStackEffects, Opcode, Operand, SymbolicValue,
    };

    // def countdown(n):
    //     while n > 0:
    //         n = n - 1
    //     return None
    fn countdown_function() -> Vec<Instruction> {
        vec![
            Instruction::new(0, Opcode::Resume, Some(0), None),
            Instruction::new(2, Opcode::LoadFast, Some(0), Some(Operand::name("n"))),
            Instruction::new(4, Opcode::LoadConst, Some(1), Some(Operand::int(0))),
            Instruction::new(6, Opcode::CompareOp, Some(68), Some(Operand::text(">"))),
            Instruction::new(8, Opcode::PopJumpIfFalse, Some(5), Some(Operand::target(20))),
            Instruction::new(10, Opcode::LoadFast, Some(0), Some(Operand::name("n"))),
            Instruction::new(12, Opcode::LoadConst, Some(2), Some(Operand::int(1))),
            Instruction::new(14, Opcode::BinaryOp, Some(10), Some(Operand::text("-"))),
            Instruction::new(16, Opcode::StoreFast, Some(0), Some(Operand::name("n"))),
            Instruction::new(18, Opcode::JumpBackward, Some(9), Some(Operand::target(2))),
            Instruction::new(20, Opcode::ReturnConst, Some(0), Some(Operand::none())),
        ]
    }

    // def total(n):
    //     s = 0
    //     for i in range(n):
    //         s = s + i
    //     return s
    fn sum_range_function() -> Vec<Instruction> {
        vec![
            Instruction::new(0, Opcode::Resume, Some(0), None),
            Instruction::new(2, Opcode::LoadConst, Some(1), Some(Operand::int(0))),
            Instruction::new(4, Opcode::StoreFast, Some(1), Some(Operand::name("s"))),
            Instruction::new(6, Opcode::LoadGlobal, Some(1), Some(Operand::name("range"))),
            Instruction::new(8, Opcode::LoadFast, Some(0), Some(Operand::name("n"))),
            Instruction::new(10, Opcode::Call, Some(1), None),
            Instruction::new(12, Opcode::GetIter, None, None),
            Instruction::new(14, Opcode::ForIter, Some(6), Some(Operand::target(28))),
            Instruction::new(16, Opcode::StoreFast, Some(2), Some(Operand::name("i"))),
            Instruction::new(
                18,
                Opcode::LoadFastLoadFast,
                Some(18),
                Some(Operand::text("s, i")),
            ),
            Instruction::new(20, Opcode::BinaryOp, Some(0), Some(Operand::text("+"))),
            Instruction::new(22, Opcode::StoreFast, Some(1), Some(Operand::name("s"))),
            Instruction::new(24, Opcode::JumpBackward, Some(6), Some(Operand::target(14))),
            Instruction::new(28, Opcode::from_name("END_FOR"), None, None),
            Instruction::new(30, Opcode::LoadFast, Some(1), Some(Operand::name("s"))),
            Instruction::new(32, Opcode::ReturnValue, None, None),
        ]
    }

    // def classify(x):
    //     if x > 0:
    //         if x > 10:
    //             return 2
    //         return 1
    //     return 0
    fn classify_function() -> Vec<Instruction> {
        vec![
            Instruction::new(0, Opcode::Resume, Some(0), None),
            Instruction::new(2, Opcode::LoadFast, Some(0), Some(Operand::name("x"))),
            Instruction::new(4, Opcode::LoadConst, Some(1), Some(Operand::int(0))),
            Instruction::new(6, Opcode::CompareOp, Some(68), Some(Operand::text(">"))),
            Instruction::new(8, Opcode::PopJumpIfFalse, Some(8), Some(Operand::target(26))),
            Instruction::new(10, Opcode::LoadFast, Some(0), Some(Operand::name("x"))),
            Instruction::new(12, Opcode::LoadConst, Some(2), Some(Operand::int(10))),
            Instruction::new(14, Opcode::CompareOp, Some(68), Some(Operand::text(">"))),
            Instruction::new(16, Opcode::PopJumpIfFalse, Some(2), Some(Operand::target(22))),
            Instruction::new(18, Opcode::LoadConst, Some(3), Some(Operand::int(2))),
            Instruction::new(20, Opcode::ReturnValue, None, None),
            Instruction::new(22, Opcode::LoadConst, Some(4), Some(Operand::int(1))),
            Instruction::new(24, Opcode::ReturnValue, None, None),
            Instruction::new(26, Opcode::LoadConst, Some(1), Some(Operand::int(0))),
            Instruction::new(28, Opcode::ReturnValue, None, None),
        ]
    }

    fn all_fixtures() -> Vec<(&'static str, Vec<Instruction>)> {
        vec![
            ("countdown", countdown_function()),
            ("total", sum_range_function()),
            ("classify", classify_function()),
        ]
    }

    #[test]
    fn test_while_loop_graph_shape() {
        let graph = cfg::build(&countdown_function()).expect("Graph construction failed");
        println!(
            "countdown: {} blocks, {} instructions",
            graph.block_count(),
            graph.instruction_count()
        );

        assert_eq!(graph.block_count(), 4);
        assert_eq!(graph.entry_offset(), Some(0));

        // Preamble falls into the loop head
        assert_eq!(graph.blocks[&0].successors, vec![2]);
        assert_eq!(graph.blocks[&0].edge_to(2), Some(EdgeKind::Unconditional));

        // Loop head branches out of the loop or into the body
        let head = &graph.blocks[&2];
        assert_eq!(head.successors, vec![20, 10]);
        assert_eq!(head.edge_to(20), Some(EdgeKind::conditional("false")));
        assert_eq!(head.edge_to(10), Some(EdgeKind::conditional("true")));

        // Body jumps back to the loop head
        assert_eq!(graph.blocks[&10].successors, vec![2]);

        // The constant return ends the function with no outgoing edges
        assert!(graph.blocks[&20].successors.is_empty());
        assert_eq!(graph.exit_blocks().len(), 1);
    }

    #[test]
    fn test_for_loop_graph_shape() {
        let graph = cfg::build(&sum_range_function()).expect("Graph construction failed");
        println!(
            "total: {} blocks, {} instructions",
            graph.block_count(),
            graph.instruction_count()
        );

        assert_eq!(graph.block_count(), 4);

        // Setup block runs through the call and iterator creation
        let setup = &graph.blocks[&0];
        assert_eq!(setup.end_offset, 12);
        assert_eq!(setup.successors, vec![14]);

        // Loop head carries the iterator-advance labels
        let head = &graph.blocks[&14];
        assert_eq!(head.successors, vec![28, 16]);
        assert_eq!(head.edge_to(28), Some(EdgeKind::conditional("iteration")));
        assert_eq!(head.edge_to(16), Some(EdgeKind::conditional("exhausted")));

        // Body jumps back to the loop head
        assert_eq!(graph.blocks[&16].successors, vec![14]);

        // Cleanup block runs to the return
        let exit = &graph.blocks[&28];
        assert_eq!(exit.end_offset, 32);
        assert!(exit.successors.is_empty());
    }

    #[test]
    fn test_nested_branch_graph_shape() {
        let graph = cfg::build(&classify_function()).expect("Graph construction failed");
        println!(
            "classify: {} blocks, {} exits",
            graph.block_count(),
            graph.exit_blocks().len()
        );

        assert_eq!(graph.block_count(), 5);
        assert_eq!(graph.exit_blocks().len(), 3);

        // Outer branch
        assert_eq!(graph.blocks[&0].successors, vec![26, 10]);
        // Inner branch
        assert_eq!(graph.blocks[&10].successors, vec![22, 18]);
    }

    #[test]
    fn test_partition_covers_every_instruction_once() {
        for (label, instructions) in all_fixtures() {
            let graph = cfg::build(&instructions).expect("Graph construction failed");

            let input_offsets: BTreeSet<u32> = instructions.iter().map(|i| i.offset).collect();
            let mut block_offsets = Vec::new();
            for block in graph.blocks.values() {
                for instruction in &block.instructions {
                    block_offsets.push(instruction.offset);
                }
            }

            println!(
                "{}: {} instructions across {} blocks",
                label,
                block_offsets.len(),
                graph.block_count()
            );
            assert_eq!(
                block_offsets.len(),
                instructions.len(),
                "{}: instruction duplicated or dropped by partitioning",
                label
            );
            let covered: BTreeSet<u32> = block_offsets.iter().copied().collect();
            assert_eq!(covered, input_offsets, "{}: offsets not covered exactly", label);

            // Instructions stay contiguous and ordered inside each block
            for block in graph.blocks.values() {
                for pair in block.instructions.windows(2) {
                    assert!(pair[0].offset < pair[1].offset);
                }
            }
        }
    }

    #[test]
    fn test_graph_edges_stay_inside_graph() {
        for (label, instructions) in all_fixtures() {
            let graph = cfg::build(&instructions).expect("Graph construction failed");

            for block in graph.blocks.values() {
                assert!(
                    block.successors.len() <= 2,
                    "{}: block {} has {} successors",
                    label,
                    block.start_offset,
                    block.successors.len()
                );
                for target in &block.successors {
                    assert!(
                        graph.blocks.contains_key(target),
                        "{}: edge from {} to {} leaves the graph",
                        label,
                        block.start_offset,
                        target
                    );
                    assert!(
                        block.edge_to(*target).is_some(),
                        "{}: edge from {} to {} is unclassified",
                        label,
                        block.start_offset,
                        target
                    );
                }
            }
        }
    }

    /// Net stack effect of an opcode when it does not depend on runtime
    /// stack contents. `Call` is excluded: its pop count varies with the
    /// null receiver marker.
    fn static_net_effect(instruction: &Instruction) -> Option<isize> {
        let arg = instruction.arg.unwrap_or(0) as isize;
        match &instruction.opcode {
            Opcode::Resume
            | Opcode::Nop
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::Swap
            | Opcode::GetIter
            | Opcode::ReturnConst
            | Opcode::JumpForward
            | Opcode::JumpBackward
            | Opcode::JumpAbsolute
            | Opcode::JumpIfTrueOrPop
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfNotExcMatch => Some(0),
            Opcode::LoadConst
            | Opcode::LoadFast
            | Opcode::LoadName
            | Opcode::PushNull
            | Opcode::DupTop
            | Opcode::Copy
            | Opcode::ForIter => Some(1),
            Opcode::LoadFastLoadFast => Some(2),
            Opcode::LoadGlobal => {
                Some(if instruction.arg.map_or(false, |a| a & 1 == 1) {
                    2
                } else {
                    1
                })
            }
            Opcode::StoreFast
            | Opcode::StoreName
            | Opcode::PopTop
            | Opcode::ReturnValue
            | Opcode::Reraise
            | Opcode::BinaryOp
            | Opcode::CompareOp
            | Opcode::ContainsOp
            | Opcode::IsOp
            | Opcode::PopJumpIfTrue
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfNone
            | Opcode::PopJumpIfNotNone => Some(-1),
            Opcode::StoreFastStoreFast => Some(-2),
            Opcode::BuildList | Opcode::BuildTuple => Some(1 - arg),
            Opcode::BuildMap => Some(1 - 2 * arg),
            Opcode::RaiseVarargs => Some(-arg),
            Opcode::Call | Opcode::CallFunction | Opcode::Other(_) => None,
        }
    }

    #[test]
    fn test_stack_balance_matches_effect_table() {
        let metadata = FunctionMetadata::with_params(&["n"]);
        let args = CallArgs::positional(vec![SymbolicValue::int(3)]);

        for (label, instructions) in all_fixtures() {
            let trace = trace::run(&instructions, &metadata, &args, &NoStackEffects);
            let mut checked = 0;

            for (step, instruction) in trace.steps.iter().zip(&instructions) {
                if let Some(expected) = static_net_effect(instruction) {
                    assert_eq!(
                        step.net_effect(),
                        expected,
                        "{}: {} at offset {} moved the stack by {} instead of {}",
                        label,
                        step.opcode,
                        step.offset,
                        step.net_effect(),
                        expected
                    );
                    checked += 1;
                }
            }

            println!("{}: {} of {} steps balanced", label, checked, trace.step_count());
            assert!(checked > 0, "{}: no statically known effects covered", label);
        }
    }

    #[test]
    fn test_rebuilding_gives_identical_results() {
        for (label, instructions) in all_fixtures() {
            let first = cfg::build(&instructions).expect("Graph construction failed");
            let second = cfg::build(&instructions).expect("Graph construction failed");
            assert_eq!(first, second, "{}: graph construction is not deterministic", label);

            let metadata = FunctionMetadata::with_params(&["n"]);
            let args = CallArgs::positional(vec![SymbolicValue::int(3)]);
            let first = trace::run(&instructions, &metadata, &args, &NoStackEffects);
            let second = trace::run(&instructions, &metadata, &args, &NoStackEffects);
            assert_eq!(first, second, "{}: simulation is not deterministic", label);
        }
    }

    #[test]
    fn test_batch_matches_individual_builds() {
        let batch: Vec<Vec<Instruction>> =
            all_fixtures().into_iter().map(|(_, instructions)| instructions).collect();

        let graphs = cfg::build_all(&batch).expect("Batch construction failed");
        assert_eq!(graphs.len(), batch.len());

        for (instructions, graph) in batch.iter().zip(&graphs) {
            let individual = cfg::build(instructions).expect("Graph construction failed");
            assert_eq!(*graph, individual);
        }
    }

    #[test]
    fn test_while_loop_trace() {
        let instructions = countdown_function();
        let metadata = FunctionMetadata::with_params(&["n"]);
        let args = CallArgs::positional(vec![SymbolicValue::int(3)]);

        let trace = trace::run(&instructions, &metadata, &args, &NoStackEffects);
        println!("countdown trace: {} steps", trace.step_count());

        // The walk is linear, so the loop body runs once and the trailing
        // return stops the simulation
        assert_eq!(trace.step_count(), instructions.len());
        assert_eq!(trace.steps.last().unwrap().opcode, "RETURN_CONST");

        // n > 0 folded and the branch consumed the result
        assert_eq!(trace.steps[3].stack_after, vec![SymbolicValue::boolean(true)]);
        assert!(trace.steps[4].stack_after.is_empty());

        // n - 1 folded through the store
        let locals = trace.final_locals().unwrap();
        assert_eq!(locals["n"], SymbolicValue::int(2));
    }

    #[test]
    fn test_for_loop_trace() {
        let instructions = sum_range_function();
        let metadata = FunctionMetadata::with_params(&["n"]);
        let args = CallArgs::positional(vec![SymbolicValue::int(3)]);

        let trace = trace::run(&instructions, &metadata, &args, &NoStackEffects);
        for step in &trace.steps {
            println!(
                "{:>4}  {:<22} {:?}",
                step.offset, step.opcode, step.stack_after
            );
        }

        assert_eq!(trace.step_count(), instructions.len());

        // The global load leaves the callable plus its null receiver slot
        let global = &trace.steps[3];
        assert_eq!(global.opcode, "LOAD_GLOBAL");
        assert_eq!(global.operand_display, "range + NULL");
        assert_eq!(global.stack_after.len(), 2);
        assert!(global.stack_after[1].is_null());

        // The call collapses callable, marker, and argument into one value
        let call = &trace.steps[5];
        assert_eq!(
            call.stack_after,
            vec![SymbolicValue::placeholder("<range>(3)")]
        );

        // Iteration pushes an opaque item above the iterator
        let advance = &trace.steps[7];
        assert_eq!(advance.opcode, "FOR_ITER");
        assert_eq!(
            advance.stack_after,
            vec![
                SymbolicValue::placeholder("iter(<range>(3))"),
                SymbolicValue::placeholder("<next_item>"),
            ]
        );

        // One pass of the body leaves a symbolic accumulator
        let locals = trace.final_locals().unwrap();
        assert_eq!(locals["i"], SymbolicValue::placeholder("<next_item>"));
        assert_eq!(locals["s"], SymbolicValue::placeholder("(0 + <next_item>)"));
        assert_eq!(trace.max_stack_depth(), 3);
    }

    #[test]
    fn test_constant_classification_trace() {
        let instructions = classify_function();
        let metadata = FunctionMetadata::with_params(&["x"]);

        // Both comparisons fold with a concrete argument
        let args = CallArgs::positional(vec![SymbolicValue::int(15)]);
        let trace = trace::run(&instructions, &metadata, &args, &NoStackEffects);

        assert_eq!(trace.steps[3].stack_after, vec![SymbolicValue::boolean(true)]);
        assert_eq!(trace.steps[7].stack_after, vec![SymbolicValue::boolean(true)]);

        // Linear walk reaches the first return and stops there
        assert_eq!(trace.steps.last().unwrap().offset, 20);
        assert_eq!(trace.step_count(), 11);
    }

    #[test]
    fn test_every_format_end_to_end() {
        let instructions = sum_range_function();
        let graph = cfg::build(&instructions).expect("Graph construction failed");
        let metadata = FunctionMetadata::with_params(&["n"]);
        let args = CallArgs::positional(vec![SymbolicValue::int(3)]);
        let trace = trace::run(&instructions, &metadata, &args, &NoStackEffects);

        let analyses = [
            Analysis::Cfg(graph),
            Analysis::Trace(trace),
        ];

        println!("Testing output formats...");
        for analysis in &analyses {
            for format in OutputFormat::available_formats() {
                println!("Testing format: {:?}", format);
                let formatter = format.get_formatter();

                let start = Instant::now();
                let output = match formatter.format(analysis, "total") {
                    Ok(result) => result,
                    Err(e) => panic!("Formatting failed for {:?}: {}", format, e),
                };
                println!("Formatting completed in {:?}", start.elapsed());

                // Verify output is non-empty
                assert!(!output.is_empty(), "Empty output for format {:?}", format);

                // Print preview
                let preview: Vec<&str> = output.lines().take(3).collect();
                for line in preview {
                    println!("  {}", line);
                }
            }
        }
    }

    #[test]
    fn test_broken_stream_is_rejected_everywhere() {
        let mut instructions = countdown_function();
        // Retarget the loop-exit branch outside the function
        instructions[4] = Instruction::new(
            8,
            Opcode::PopJumpIfFalse,
            Some(5),
            Some(Operand::target(98)),
        );

        match cfg::build(&instructions) {
            Err(AnalysisError::DecodeInconsistency { offset, target }) => {
                assert_eq!(offset, 8);
                assert_eq!(target, 98);
            }
            other => panic!("expected decode inconsistency, got {:?}", other),
        }

        // The batch entry point surfaces the same failure
        assert!(cfg::build_all(&[instructions]).is_err());
    }

    #[test]
    fn test_branch_without_target_keeps_fallthrough() {
        // A conditional branch whose operand was not decoded loses its taken
        // edge but still falls through to the next block
        let instructions = vec![
            Instruction::new(0, Opcode::LoadFast, Some(0), Some(Operand::name("x"))),
            Instruction::new(2, Opcode::PopJumpIfFalse, None, None),
            Instruction::new(4, Opcode::ReturnConst, Some(0), Some(Operand::none())),
        ];
        let graph = cfg::build(&instructions).expect("Graph construction failed");

        assert_eq!(graph.block_count(), 2);
        assert_eq!(graph.blocks[&0].successors, vec![4]);
        assert_eq!(
            graph.blocks[&0].edge_to(4),
            Some(EdgeKind::conditional("true"))
        );
        assert!(graph.blocks[&4].successors.is_empty());
    }

    #[test]
    fn test_unconditional_jump_without_target_gets_no_edges() {
        // An undecoded unconditional jump has no fall-through path either
        let instructions = vec![
            Instruction::new(0, Opcode::JumpForward, None, None),
            Instruction::new(2, Opcode::ReturnConst, Some(0), Some(Operand::none())),
        ];
        let graph = cfg::build(&instructions).expect("Graph construction failed");

        assert_eq!(graph.block_count(), 2);
        assert!(graph.blocks[&0].successors.is_empty());
    }

    #[test]
    fn test_empty_function_everywhere() {
        let graph = cfg::build(&[]).expect("Graph construction failed");
        assert!(graph.is_empty());

        let trace = trace::run(
            &[],
            &FunctionMetadata::default(),
            &CallArgs::default(),
            &NoStackEffects,
        );
        assert!(trace.is_empty());
        assert_eq!(trace.final_locals(), None);

        // Formatters accept empty analyses
        for format in OutputFormat::available_formats() {
            let formatter = format.get_formatter();
            let output = formatter
                .format(&Analysis::Cfg(graph.clone()), "empty")
                .expect("Formatting failed");
            let _ = output;
        }
    }
}
