//! Symbolic execution of an instruction sequence.
//!
//! The simulator walks the sequence in decode order, maintaining an operand
//! stack of [`SymbolicValue`]s and a map of local bindings. Values fold to
//! concrete scalars where the instruction semantics allow it; everything
//! else becomes a placeholder carrying display text. Opcodes outside the
//! modeled set fall back to a [`StackEffectSource`] lookup, and opcodes that
//! would underflow the stack leave it untouched.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::{
    CallArgs, ExecutionStep, FunctionMetadata, Instruction, Opcode, Operand, Scalar,
    StackEffectSource, SymbolicValue, Trace,
};

/// Simulate one function and record a step per executed instruction.
///
/// Simulation is linear: branches are not followed, and the walk stops after
/// the first return instruction. Raise instructions only adjust the stack.
pub fn run(
    instructions: &[Instruction],
    metadata: &FunctionMetadata,
    args: &CallArgs,
    effects: &dyn StackEffectSource,
) -> Trace {
    let mut simulator = StackSimulator::new(metadata, args, effects);
    let mut steps = Vec::new();

    for instruction in instructions {
        let step = simulator.step(instruction);
        let returned = instruction.opcode.is_return();
        steps.push(step);
        if returned {
            break;
        }
    }

    debug!(
        "traced {} of {} instructions, final stack depth {}",
        steps.len(),
        instructions.len(),
        simulator.stack.len()
    );
    Trace { steps }
}

/// Operand stack and local bindings of one simulated activation.
struct StackSimulator<'a> {
    stack: Vec<SymbolicValue>,
    locals: BTreeMap<String, SymbolicValue>,
    effects: &'a dyn StackEffectSource,
}

impl<'a> StackSimulator<'a> {
    /// Bind arguments to parameters: positional in declaration order, then
    /// keyword arguments, then defaults for declared parameters still
    /// unbound.
    fn new(
        metadata: &FunctionMetadata,
        args: &CallArgs,
        effects: &'a dyn StackEffectSource,
    ) -> Self {
        let mut locals = BTreeMap::new();
        for (param, value) in metadata.params.iter().zip(&args.positional) {
            locals.insert(param.clone(), value.clone());
        }
        for (name, value) in &args.keyword {
            locals.insert(name.clone(), value.clone());
        }
        for (name, value) in &metadata.defaults {
            if metadata.params.contains(name) && !locals.contains_key(name) {
                locals.insert(name.clone(), value.clone());
            }
        }

        Self {
            stack: Vec::new(),
            locals,
            effects,
        }
    }

    /// Apply one instruction and record the state transition.
    fn step(&mut self, instruction: &Instruction) -> ExecutionStep {
        let stack_before = self.stack.clone();
        self.apply(instruction);

        ExecutionStep {
            offset: instruction.offset,
            opcode: instruction.opcode.name().to_string(),
            operand_display: instruction.operand_display(),
            stack_before,
            stack_after: self.stack.clone(),
            locals: self.locals.clone(),
        }
    }

    fn apply(&mut self, instruction: &Instruction) {
        match &instruction.opcode {
            Opcode::Resume | Opcode::Nop => {}

            Opcode::LoadConst => self.stack.push(constant_value(instruction)),

            Opcode::LoadFast | Opcode::LoadName => {
                let name = operand_text(instruction, "?");
                self.stack.push(self.lookup(&name));
            }

            Opcode::LoadFastLoadFast => {
                for name in operand_names(instruction) {
                    self.stack.push(self.lookup(&name));
                }
            }

            Opcode::LoadGlobal => {
                let name = operand_text(instruction, "?");
                self.stack
                    .push(SymbolicValue::placeholder(&format!("<{}>", name)));
                if instruction.arg.map_or(false, |arg| arg & 1 == 1) {
                    self.stack.push(SymbolicValue::null());
                }
            }

            Opcode::PushNull => self.stack.push(SymbolicValue::null()),

            Opcode::StoreFast | Opcode::StoreName => {
                if let Some(value) = self.stack.pop() {
                    self.locals.insert(operand_text(instruction, "?"), value);
                }
            }

            Opcode::StoreFastStoreFast => {
                let names = operand_names(instruction);
                if let [first, second] = names.as_slice() {
                    if let Some(value) = self.stack.pop() {
                        self.locals.insert(second.clone(), value);
                    }
                    if let Some(value) = self.stack.pop() {
                        self.locals.insert(first.clone(), value);
                    }
                }
            }

            Opcode::BinaryOp => {
                if self.stack.len() >= 2 {
                    let right = self.stack.pop().unwrap();
                    let left = self.stack.pop().unwrap();
                    let op = operand_text(instruction, "op");
                    let op = arithmetic_op(&op);
                    let value = fold_arithmetic(&left, op, &right).unwrap_or_else(|| {
                        SymbolicValue::placeholder(&format!("({} {} {})", left, op, right))
                    });
                    self.stack.push(value);
                }
            }

            Opcode::CompareOp => {
                if self.stack.len() >= 2 {
                    let right = self.stack.pop().unwrap();
                    let left = self.stack.pop().unwrap();
                    let op = operand_text(instruction, "cmp");
                    let op = comparison_op(&op);
                    let value = fold_comparison(&left, op, &right).unwrap_or_else(|| {
                        SymbolicValue::placeholder(&format!("({} {} {})", left, op, right))
                    });
                    self.stack.push(value);
                }
            }

            // Membership and identity stay symbolic; the simulator does not
            // model object identity or containers precisely enough to fold
            Opcode::ContainsOp | Opcode::IsOp => {
                if self.stack.len() >= 2 {
                    let right = self.stack.pop().unwrap();
                    let left = self.stack.pop().unwrap();
                    let op = match &instruction.argval {
                        Some(Operand::Text(text)) => text.clone(),
                        _ => identity_op(&instruction.opcode, instruction.arg).to_string(),
                    };
                    self.stack
                        .push(SymbolicValue::placeholder(&format!("({} {} {})", left, op, right)));
                }
            }

            Opcode::UnaryNegative => {
                if let Some(value) = self.stack.pop() {
                    let negated = fold_negate(&value).unwrap_or_else(|| {
                        SymbolicValue::placeholder(&format!("(-{})", value))
                    });
                    self.stack.push(negated);
                }
            }

            Opcode::UnaryNot => {
                if let Some(value) = self.stack.pop() {
                    let truth = value.as_scalar().and_then(Scalar::truthiness);
                    let inverted = match truth {
                        Some(truth) => SymbolicValue::boolean(!truth),
                        None => SymbolicValue::placeholder(&format!("(not {})", value)),
                    };
                    self.stack.push(inverted);
                }
            }

            Opcode::Call => self.apply_call(instruction, true),
            Opcode::CallFunction => self.apply_call(instruction, false),

            Opcode::ReturnValue => {
                self.stack.pop();
            }
            Opcode::ReturnConst => {}

            Opcode::RaiseVarargs => {
                let argc = instruction.arg.unwrap_or(0) as usize;
                for _ in 0..argc {
                    self.stack.pop();
                }
            }
            Opcode::Reraise => {
                self.stack.pop();
            }

            Opcode::PopTop => {
                self.stack.pop();
            }

            Opcode::DupTop => {
                if let Some(top) = self.stack.last().cloned() {
                    self.stack.push(top);
                }
            }

            Opcode::Copy => {
                let depth = instruction.arg.unwrap_or(1) as usize;
                if depth >= 1 && self.stack.len() >= depth {
                    let value = self.stack[self.stack.len() - depth].clone();
                    self.stack.push(value);
                }
            }

            Opcode::Swap => {
                let depth = instruction.arg.unwrap_or(2) as usize;
                if depth >= 2 && self.stack.len() >= depth {
                    let top = self.stack.len() - 1;
                    self.stack.swap(top, top + 1 - depth);
                }
            }

            Opcode::BuildList | Opcode::BuildTuple => {
                let count = instruction.arg.unwrap_or(0) as usize;
                if self.stack.len() >= count {
                    let items = self.stack.split_off(self.stack.len() - count);
                    let value = match instruction.opcode {
                        Opcode::BuildList => SymbolicValue::List(items),
                        _ => SymbolicValue::Tuple(items),
                    };
                    self.stack.push(value);
                }
            }

            Opcode::BuildMap => {
                let count = instruction.arg.unwrap_or(0) as usize;
                if self.stack.len() >= count * 2 {
                    let mut pairs = Vec::with_capacity(count);
                    for _ in 0..count {
                        let value = self.stack.pop();
                        let key = self.stack.pop();
                        if let (Some(key), Some(value)) = (key, value) {
                            pairs.push((key, value));
                        }
                    }
                    // Popping walks the pairs last-to-first
                    pairs.reverse();
                    self.stack.push(SymbolicValue::Map(pairs));
                }
            }

            Opcode::GetIter => {
                if let Some(value) = self.stack.pop() {
                    self.stack
                        .push(SymbolicValue::placeholder(&format!("iter({})", value)));
                }
            }

            // The iterator stays on the stack; each iteration pushes the
            // produced item above it
            Opcode::ForIter => self.stack.push(SymbolicValue::placeholder("<next_item>")),

            Opcode::PopJumpIfTrue
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfNone
            | Opcode::PopJumpIfNotNone => {
                self.stack.pop();
            }

            Opcode::JumpIfTrueOrPop
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfNotExcMatch
            | Opcode::JumpForward
            | Opcode::JumpBackward
            | Opcode::JumpAbsolute => {}

            Opcode::Other(name) => {
                match self.effects.stack_effect(&instruction.opcode, instruction.arg) {
                    Some(effect) => {
                        for _ in 0..effect.pops.min(self.stack.len()) {
                            self.stack.pop();
                        }
                        for _ in 0..effect.pushes {
                            self.stack
                                .push(SymbolicValue::placeholder(&format!("<{}_result>", name)));
                        }
                    }
                    None => warn!("no stack effect information for {}, treating as no-op", name),
                }
            }
        }
    }

    /// Pop a call frame shape and push a placeholder naming the call.
    ///
    /// With `null_marker` set (the current calling convention), a null
    /// receiver slot left under the arguments is discarded before the
    /// callable itself is popped.
    fn apply_call(&mut self, instruction: &Instruction, null_marker: bool) {
        let argc = instruction.arg.unwrap_or(0) as usize;
        if self.stack.len() < argc + 1 {
            return;
        }

        let mut call_args = Vec::with_capacity(argc);
        for _ in 0..argc {
            if let Some(value) = self.stack.pop() {
                call_args.push(value);
            }
        }
        call_args.reverse();

        if null_marker && self.stack.last().map_or(false, SymbolicValue::is_null) {
            self.stack.pop();
        }
        let callee = match self.stack.pop() {
            Some(value) => value.to_string(),
            None => "<?>".to_string(),
        };

        let rendered: Vec<String> = call_args.iter().map(ToString::to_string).collect();
        self.stack.push(SymbolicValue::placeholder(&format!(
            "{}({})",
            callee,
            rendered.join(", ")
        )));
    }

    /// Local binding for `name`, or a placeholder when unbound.
    fn lookup(&self, name: &str) -> SymbolicValue {
        self.locals
            .get(name)
            .cloned()
            .unwrap_or_else(|| SymbolicValue::placeholder(&format!("<{}>", name)))
    }
}

/// Constant operand as a symbolic value.
fn constant_value(instruction: &Instruction) -> SymbolicValue {
    match &instruction.argval {
        Some(Operand::Const(scalar)) => SymbolicValue::Concrete(scalar.clone()),
        Some(Operand::Text(text)) => SymbolicValue::placeholder(text),
        Some(Operand::Name(name)) => SymbolicValue::placeholder(&format!("<{}>", name)),
        Some(Operand::Target(target)) => SymbolicValue::placeholder(&format!("<{}>", target)),
        None => SymbolicValue::placeholder("<const>"),
    }
}

/// Operand as plain text, with a fallback for missing operands.
fn operand_text(instruction: &Instruction, default: &str) -> String {
    match &instruction.argval {
        Some(Operand::Name(name)) => name.clone(),
        Some(Operand::Text(text)) => text.clone(),
        Some(Operand::Const(Scalar::Str(s))) => s.clone(),
        Some(Operand::Const(scalar)) => scalar.to_string(),
        _ => default.to_string(),
    }
}

/// Names from a fused-operand list such as `a, b`.
fn operand_names(instruction: &Instruction) -> Vec<String> {
    operand_text(instruction, "")
        .split(',')
        .map(|part| {
            part.trim()
                .trim_matches(|c| c == '(' || c == ')' || c == '\'')
                .to_string()
        })
        .filter(|part| !part.is_empty())
        .collect()
}

/// Display text for identity and membership tests when the operand was not
/// decoded.
fn identity_op(opcode: &Opcode, arg: Option<u32>) -> &'static str {
    let inverted = arg == Some(1);
    match opcode {
        Opcode::IsOp if inverted => "is not",
        Opcode::IsOp => "is",
        _ if inverted => "not in",
        _ => "in",
    }
}

/// Strip the augmented-assignment suffix so `+=` folds like `+`.
fn arithmetic_op(text: &str) -> &str {
    match text {
        "==" | "!=" | "<=" | ">=" => text,
        _ => text.strip_suffix('=').unwrap_or(text),
    }
}

/// Strip the coercion wrapper some decoders put around comparison operators.
fn comparison_op(text: &str) -> &str {
    text.strip_prefix("bool(")
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(text)
}

/// Numeric view of a scalar, with booleans widening to integers.
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(&self) -> f64 {
        match self {
            Number::Int(v) => *v as f64,
            Number::Float(v) => *v,
        }
    }
}

fn as_number(value: &SymbolicValue) -> Option<Number> {
    match value.as_scalar()? {
        Scalar::Int(v) => Some(Number::Int(*v)),
        Scalar::Float(v) => Some(Number::Float(*v)),
        Scalar::Bool(v) => Some(Number::Int(*v as i64)),
        _ => None,
    }
}

/// Fold an arithmetic operation over two concrete numbers. Returns `None`
/// when either operand is symbolic or the operation has no defined result
/// (division by zero, integer overflow).
fn fold_arithmetic(left: &SymbolicValue, op: &str, right: &SymbolicValue) -> Option<SymbolicValue> {
    let (lhs, rhs) = (as_number(left)?, as_number(right)?);
    match (lhs, rhs) {
        (Number::Int(l), Number::Int(r)) => fold_int(l, op, r),
        (lhs, rhs) => fold_float(lhs.as_f64(), op, rhs.as_f64()),
    }
}

fn fold_int(l: i64, op: &str, r: i64) -> Option<SymbolicValue> {
    let value = match op {
        "+" => Scalar::Int(l.checked_add(r)?),
        "-" => Scalar::Int(l.checked_sub(r)?),
        "*" => Scalar::Int(l.checked_mul(r)?),
        // True division always yields a float
        "/" => {
            if r == 0 {
                return None;
            }
            Scalar::Float(l as f64 / r as f64)
        }
        "//" => Scalar::Int(floor_div(l, r)?),
        "%" => Scalar::Int(floor_mod(l, r)?),
        "**" => return int_pow(l, r),
        _ => return None,
    };
    Some(SymbolicValue::Concrete(value))
}

fn fold_float(l: f64, op: &str, r: f64) -> Option<SymbolicValue> {
    let value = match op {
        "+" => l + r,
        "-" => l - r,
        "*" => l * r,
        "/" => {
            if r == 0.0 {
                return None;
            }
            l / r
        }
        "//" => {
            if r == 0.0 {
                return None;
            }
            (l / r).floor()
        }
        "%" => {
            if r == 0.0 {
                return None;
            }
            let remainder = l % r;
            if remainder != 0.0 && (remainder < 0.0) != (r < 0.0) {
                remainder + r
            } else {
                remainder
            }
        }
        "**" => {
            if l == 0.0 && r < 0.0 {
                return None;
            }
            l.powf(r)
        }
        _ => return None,
    };
    if value.is_nan() {
        None
    } else {
        Some(SymbolicValue::float(value))
    }
}

/// Floor division rounding toward negative infinity.
fn floor_div(l: i64, r: i64) -> Option<i64> {
    let quotient = l.checked_div(r)?;
    let remainder = l.checked_rem(r)?;
    if remainder != 0 && (remainder < 0) != (r < 0) {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

/// Modulo taking the sign of the divisor.
fn floor_mod(l: i64, r: i64) -> Option<i64> {
    let remainder = l.checked_rem(r)?;
    if remainder != 0 && (remainder < 0) != (r < 0) {
        Some(remainder + r)
    } else {
        Some(remainder)
    }
}

/// Exponentiation: negative exponents move to floats, like the source
/// language's semantics.
fn int_pow(l: i64, r: i64) -> Option<SymbolicValue> {
    if r < 0 {
        if l == 0 {
            return None;
        }
        let exp = i32::try_from(r).ok()?;
        return Some(SymbolicValue::float((l as f64).powi(exp)));
    }
    let exp = u32::try_from(r).ok()?;
    Some(SymbolicValue::int(l.checked_pow(exp)?))
}

/// Fold a comparison over two concrete values, yielding a boolean.
fn fold_comparison(left: &SymbolicValue, op: &str, right: &SymbolicValue) -> Option<SymbolicValue> {
    use std::cmp::Ordering;

    let ordering = match (left.as_scalar(), right.as_scalar()) {
        (Some(Scalar::Str(l)), Some(Scalar::Str(r))) => l.cmp(r),
        _ => {
            let (lhs, rhs) = (as_number(left)?, as_number(right)?);
            match (lhs, rhs) {
                (Number::Int(l), Number::Int(r)) => l.cmp(&r),
                (lhs, rhs) => lhs.as_f64().partial_cmp(&rhs.as_f64())?,
            }
        }
    };
    let result = match op {
        "==" => ordering == Ordering::Equal,
        "!=" => ordering != Ordering::Equal,
        "<" => ordering == Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        ">=" => ordering != Ordering::Less,
        _ => return None,
    };
    Some(SymbolicValue::boolean(result))
}

/// Fold unary negation over a concrete number.
fn fold_negate(value: &SymbolicValue) -> Option<SymbolicValue> {
    match as_number(value)? {
        Number::Int(v) => Some(SymbolicValue::int(v.checked_neg()?)),
        Number::Float(v) => Some(SymbolicValue::float(-v)),
    }
}
