//! Opcode categories and classification tables.
//!
//! The classification here drives both block partitioning (which opcodes
//! split control flow) and the symbolic simulator (which opcodes touch the
//! stack and how). Names outside the table are preserved verbatim in
//! [`Opcode::Other`] and routed through the fallback stack-effect lookup.

use std::fmt;

/// Opcode category of one decoded instruction.
///
/// Covers the CPython 3.11+ instruction families the analyzer models
/// explicitly, plus legacy spellings that still show up in older streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Function prologue marker, no stack effect
    Resume,
    /// No operation
    Nop,
    /// Push a constant from the constant table
    LoadConst,
    /// Push a local variable
    LoadFast,
    /// Fused push of two local variables (3.13+)
    LoadFastLoadFast,
    /// Push a global, optionally with a null receiver marker
    LoadGlobal,
    /// Push a name resolved at module scope
    LoadName,
    /// Pop into a local variable
    StoreFast,
    /// Fused pop into two local variables (3.13+)
    StoreFastStoreFast,
    /// Pop into a module-scope name
    StoreName,
    /// Binary arithmetic, operator carried in the operand
    BinaryOp,
    /// Rich comparison, operator carried in the operand
    CompareOp,
    /// Membership test (`in` / `not in`)
    ContainsOp,
    /// Identity test (`is` / `is not`)
    IsOp,
    /// Arithmetic negation of the top of stack
    UnaryNegative,
    /// Boolean negation of the top of stack
    UnaryNot,
    /// Call with N positional arguments (3.11+ convention)
    Call,
    /// Legacy call with N positional arguments (3.10 and earlier)
    CallFunction,
    /// Push the null receiver marker
    PushNull,
    /// Return the top of stack
    ReturnValue,
    /// Return a constant directly (3.12+)
    ReturnConst,
    /// Raise with N arguments
    RaiseVarargs,
    /// Re-raise the active exception
    Reraise,
    /// Discard the top of stack
    PopTop,
    /// Duplicate the top of stack (legacy)
    DupTop,
    /// Push a copy of the N-th stack entry
    Copy,
    /// Swap the top of stack with the N-th entry
    Swap,
    /// Build a list from N stack entries
    BuildList,
    /// Build a tuple from N stack entries
    BuildTuple,
    /// Build a mapping from N key/value pairs
    BuildMap,
    /// Replace the top of stack with an iterator over it
    GetIter,
    /// Advance an iterator; jumps to the target when exhausted
    ForIter,
    /// Unconditional forward jump
    JumpForward,
    /// Unconditional backward jump
    JumpBackward,
    /// Unconditional absolute jump (legacy)
    JumpAbsolute,
    /// Pop and jump when the popped value is true
    PopJumpIfTrue,
    /// Pop and jump when the popped value is false
    PopJumpIfFalse,
    /// Pop and jump when the popped value is None
    PopJumpIfNone,
    /// Pop and jump when the popped value is not None
    PopJumpIfNotNone,
    /// Jump when true, otherwise pop
    JumpIfTrueOrPop,
    /// Jump when false, otherwise pop
    JumpIfFalseOrPop,
    /// Jump when the exception does not match (legacy)
    JumpIfNotExcMatch,
    /// Any opcode outside the table, name preserved
    Other(String),
}

impl Opcode {
    /// Map a raw opcode name to its category.
    ///
    /// The directional conditional jumps of the 3.11 era fold into their
    /// base categories so both spellings classify and label identically.
    pub fn from_name(name: &str) -> Self {
        match name {
            "RESUME" => Opcode::Resume,
            "NOP" => Opcode::Nop,
            "LOAD_CONST" => Opcode::LoadConst,
            "LOAD_FAST" => Opcode::LoadFast,
            "LOAD_FAST_LOAD_FAST" => Opcode::LoadFastLoadFast,
            "LOAD_GLOBAL" => Opcode::LoadGlobal,
            "LOAD_NAME" => Opcode::LoadName,
            "STORE_FAST" => Opcode::StoreFast,
            "STORE_FAST_STORE_FAST" => Opcode::StoreFastStoreFast,
            "STORE_NAME" => Opcode::StoreName,
            "BINARY_OP" => Opcode::BinaryOp,
            "COMPARE_OP" => Opcode::CompareOp,
            "CONTAINS_OP" => Opcode::ContainsOp,
            "IS_OP" => Opcode::IsOp,
            "UNARY_NEGATIVE" => Opcode::UnaryNegative,
            "UNARY_NOT" => Opcode::UnaryNot,
            "CALL" => Opcode::Call,
            "CALL_FUNCTION" => Opcode::CallFunction,
            "PUSH_NULL" => Opcode::PushNull,
            "RETURN_VALUE" => Opcode::ReturnValue,
            "RETURN_CONST" => Opcode::ReturnConst,
            "RAISE_VARARGS" => Opcode::RaiseVarargs,
            "RERAISE" => Opcode::Reraise,
            "POP_TOP" => Opcode::PopTop,
            "DUP_TOP" => Opcode::DupTop,
            "COPY" => Opcode::Copy,
            "SWAP" => Opcode::Swap,
            "BUILD_LIST" => Opcode::BuildList,
            "BUILD_TUPLE" => Opcode::BuildTuple,
            "BUILD_MAP" => Opcode::BuildMap,
            "GET_ITER" => Opcode::GetIter,
            "FOR_ITER" => Opcode::ForIter,
            "JUMP_FORWARD" => Opcode::JumpForward,
            "JUMP_BACKWARD" => Opcode::JumpBackward,
            "JUMP_ABSOLUTE" => Opcode::JumpAbsolute,
            "POP_JUMP_IF_TRUE" | "POP_JUMP_FORWARD_IF_TRUE" | "POP_JUMP_BACKWARD_IF_TRUE" => {
                Opcode::PopJumpIfTrue
            }
            "POP_JUMP_IF_FALSE" | "POP_JUMP_FORWARD_IF_FALSE" | "POP_JUMP_BACKWARD_IF_FALSE" => {
                Opcode::PopJumpIfFalse
            }
            "POP_JUMP_IF_NONE" | "POP_JUMP_FORWARD_IF_NONE" | "POP_JUMP_BACKWARD_IF_NONE" => {
                Opcode::PopJumpIfNone
            }
            "POP_JUMP_IF_NOT_NONE"
            | "POP_JUMP_FORWARD_IF_NOT_NONE"
            | "POP_JUMP_BACKWARD_IF_NOT_NONE" => Opcode::PopJumpIfNotNone,
            "JUMP_IF_TRUE_OR_POP" => Opcode::JumpIfTrueOrPop,
            "JUMP_IF_FALSE_OR_POP" => Opcode::JumpIfFalseOrPop,
            "JUMP_IF_NOT_EXC_MATCH" => Opcode::JumpIfNotExcMatch,
            other => Opcode::Other(other.to_string()),
        }
    }

    /// Canonical opcode name.
    pub fn name(&self) -> &str {
        match self {
            Opcode::Resume => "RESUME",
            Opcode::Nop => "NOP",
            Opcode::LoadConst => "LOAD_CONST",
            Opcode::LoadFast => "LOAD_FAST",
            Opcode::LoadFastLoadFast => "LOAD_FAST_LOAD_FAST",
            Opcode::LoadGlobal => "LOAD_GLOBAL",
            Opcode::LoadName => "LOAD_NAME",
            Opcode::StoreFast => "STORE_FAST",
            Opcode::StoreFastStoreFast => "STORE_FAST_STORE_FAST",
            Opcode::StoreName => "STORE_NAME",
            Opcode::BinaryOp => "BINARY_OP",
            Opcode::CompareOp => "COMPARE_OP",
            Opcode::ContainsOp => "CONTAINS_OP",
            Opcode::IsOp => "IS_OP",
            Opcode::UnaryNegative => "UNARY_NEGATIVE",
            Opcode::UnaryNot => "UNARY_NOT",
            Opcode::Call => "CALL",
            Opcode::CallFunction => "CALL_FUNCTION",
            Opcode::PushNull => "PUSH_NULL",
            Opcode::ReturnValue => "RETURN_VALUE",
            Opcode::ReturnConst => "RETURN_CONST",
            Opcode::RaiseVarargs => "RAISE_VARARGS",
            Opcode::Reraise => "RERAISE",
            Opcode::PopTop => "POP_TOP",
            Opcode::DupTop => "DUP_TOP",
            Opcode::Copy => "COPY",
            Opcode::Swap => "SWAP",
            Opcode::BuildList => "BUILD_LIST",
            Opcode::BuildTuple => "BUILD_TUPLE",
            Opcode::BuildMap => "BUILD_MAP",
            Opcode::GetIter => "GET_ITER",
            Opcode::ForIter => "FOR_ITER",
            Opcode::JumpForward => "JUMP_FORWARD",
            Opcode::JumpBackward => "JUMP_BACKWARD",
            Opcode::JumpAbsolute => "JUMP_ABSOLUTE",
            Opcode::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Opcode::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Opcode::PopJumpIfNone => "POP_JUMP_IF_NONE",
            Opcode::PopJumpIfNotNone => "POP_JUMP_IF_NOT_NONE",
            Opcode::JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            Opcode::JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            Opcode::JumpIfNotExcMatch => "JUMP_IF_NOT_EXC_MATCH",
            Opcode::Other(name) => name,
        }
    }

    /// True for every opcode that can transfer control to a jump target.
    pub const fn is_branch(&self) -> bool {
        matches!(
            self,
            Opcode::JumpForward
                | Opcode::JumpBackward
                | Opcode::JumpAbsolute
                | Opcode::ForIter
                | Opcode::PopJumpIfTrue
                | Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfNone
                | Opcode::PopJumpIfNotNone
                | Opcode::JumpIfTrueOrPop
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfNotExcMatch
        )
    }

    /// True for branches that may also fall through (two-way control flow).
    pub const fn is_conditional_branch(&self) -> bool {
        matches!(
            self,
            Opcode::ForIter
                | Opcode::PopJumpIfTrue
                | Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfNone
                | Opcode::PopJumpIfNotNone
                | Opcode::JumpIfTrueOrPop
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfNotExcMatch
        )
    }

    /// True for opcodes that end control flow in their block.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Opcode::ReturnValue | Opcode::ReturnConst | Opcode::RaiseVarargs | Opcode::Reraise
        )
    }

    /// True for the return family that also stops the symbolic trace.
    pub const fn is_return(&self) -> bool {
        matches!(self, Opcode::ReturnValue | Opcode::ReturnConst)
    }

    /// Edge labels `(taken, fall_through)` for conditional branch families.
    ///
    /// Polarity is fixed per family: the taken edge of an if-true branch is
    /// the "true" outcome, of an if-false branch the "false" outcome, and of
    /// an iterator advance the "iteration" outcome. Families without encoded
    /// polarity get the generic pair.
    pub const fn branch_labels(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Opcode::PopJumpIfTrue | Opcode::JumpIfTrueOrPop => Some(("true", "false")),
            Opcode::PopJumpIfFalse | Opcode::JumpIfFalseOrPop => Some(("false", "true")),
            Opcode::ForIter => Some(("iteration", "exhausted")),
            Opcode::PopJumpIfNone | Opcode::PopJumpIfNotNone | Opcode::JumpIfNotExcMatch => {
                Some(("branch", "fall-through"))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_roundtrip() {
        let names = [
            "RESUME",
            "LOAD_CONST",
            "LOAD_FAST_LOAD_FAST",
            "BINARY_OP",
            "FOR_ITER",
            "POP_JUMP_IF_FALSE",
            "RETURN_CONST",
        ];
        for name in names {
            assert_eq!(Opcode::from_name(name).name(), name);
        }
    }

    #[test]
    fn test_directional_jumps_normalize() {
        assert_eq!(
            Opcode::from_name("POP_JUMP_FORWARD_IF_FALSE"),
            Opcode::PopJumpIfFalse
        );
        assert_eq!(
            Opcode::from_name("POP_JUMP_BACKWARD_IF_TRUE"),
            Opcode::PopJumpIfTrue
        );
        assert_eq!(
            Opcode::from_name("POP_JUMP_FORWARD_IF_NOT_NONE"),
            Opcode::PopJumpIfNotNone
        );
    }

    #[test]
    fn test_unknown_name_preserved() {
        let op = Opcode::from_name("MAKE_FUNCTION");
        assert_eq!(op, Opcode::Other("MAKE_FUNCTION".to_string()));
        assert_eq!(op.name(), "MAKE_FUNCTION");
        assert!(!op.is_branch());
        assert!(!op.is_terminal());
    }

    #[test]
    fn test_branch_classification() {
        assert!(Opcode::JumpForward.is_branch());
        assert!(!Opcode::JumpForward.is_conditional_branch());
        assert!(Opcode::ForIter.is_branch());
        assert!(Opcode::ForIter.is_conditional_branch());
        assert!(Opcode::PopJumpIfNone.is_conditional_branch());
        assert!(!Opcode::ReturnValue.is_branch());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Opcode::ReturnValue.is_terminal());
        assert!(Opcode::ReturnConst.is_terminal());
        assert!(Opcode::RaiseVarargs.is_terminal());
        assert!(Opcode::Reraise.is_terminal());
        assert!(Opcode::ReturnConst.is_return());
        assert!(!Opcode::RaiseVarargs.is_return());
    }

    #[test]
    fn test_branch_labels() {
        assert_eq!(
            Opcode::PopJumpIfTrue.branch_labels(),
            Some(("true", "false"))
        );
        assert_eq!(
            Opcode::PopJumpIfFalse.branch_labels(),
            Some(("false", "true"))
        );
        assert_eq!(
            Opcode::ForIter.branch_labels(),
            Some(("iteration", "exhausted"))
        );
        assert_eq!(
            Opcode::PopJumpIfNone.branch_labels(),
            Some(("branch", "fall-through"))
        );
        assert_eq!(Opcode::JumpForward.branch_labels(), None);
    }
}
