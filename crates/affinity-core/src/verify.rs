//! Structural verification of method bodies.
//!
//! A single forward pass of abstract interpretation over operand-stack depth:
//! every reachable instruction gets exactly one entry depth, underflow and
//! `max_stack` overflow are rejected, branch targets must stay inside the body
//! and control may not fall off the end. The rewrite engine runs this on its
//! own output to catch emission defects before a unit is handed back.

use affinity_audit_types::descriptor::{parse_method_descriptor, MethodDescriptor};
use affinity_audit_types::{CompiledUnit, Instruction, MethodDef};
use serde::Serialize;
use std::fmt;

/// Why a method body was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VerifyError {
    EmptyBody,
    BadDescriptor { descriptor: String },
    StackUnderflow { pc: usize },
    StackOverflow { pc: usize, depth: usize, max: u16 },
    InconsistentStack { pc: usize, expected: usize, found: usize },
    JumpOutOfRange { pc: usize, target: u32 },
    FallsOffEnd { pc: usize },
    InvalidLocal { pc: usize, index: u16 },
    ReturnMismatch { pc: usize },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::EmptyBody => write!(f, "empty body"),
            VerifyError::BadDescriptor { descriptor } => {
                write!(f, "malformed descriptor {}", descriptor)
            }
            VerifyError::StackUnderflow { pc } => write!(f, "stack underflow at {}", pc),
            VerifyError::StackOverflow { pc, depth, max } => write!(
                f,
                "stack depth {} exceeds max_stack {} at {}",
                depth, max, pc
            ),
            VerifyError::InconsistentStack {
                pc,
                expected,
                found,
            } => write!(
                f,
                "inconsistent stack depth at {}: {} vs {}",
                pc, expected, found
            ),
            VerifyError::JumpOutOfRange { pc, target } => {
                write!(f, "jump at {} targets {} outside the body", pc, target)
            }
            VerifyError::FallsOffEnd { pc } => {
                write!(f, "control falls off the end after {}", pc)
            }
            VerifyError::InvalidLocal { pc, index } => {
                write!(f, "local {} out of range at {}", index, pc)
            }
            VerifyError::ReturnMismatch { pc } => {
                write!(f, "return at {} does not match the descriptor", pc)
            }
        }
    }
}

impl std::error::Error for VerifyError {}

/// Net stack effect of one instruction: values consumed and produced.
fn stack_effect(instruction: &Instruction) -> Result<(usize, usize), String> {
    let invoke = |descriptor: &str, receiver: usize| -> Result<(usize, usize), String> {
        let parsed = parse_method_descriptor(descriptor).map_err(|_| descriptor.to_string())?;
        Ok((
            parsed.param_count() + receiver,
            usize::from(parsed.returns_value()),
        ))
    };
    Ok(match instruction {
        Instruction::Nop | Instruction::Goto(_) | Instruction::Return => (0, 0),
        Instruction::PushInt(_)
        | Instruction::PushBool(_)
        | Instruction::PushStr(_)
        | Instruction::PushNull
        | Instruction::Load(_)
        | Instruction::New(_)
        | Instruction::GetStatic(_)
        | Instruction::CurrentThread => (0, 1),
        Instruction::Store(_)
        | Instruction::Pop
        | Instruction::IfZero(_)
        | Instruction::IfNonZero(_)
        | Instruction::PutStatic(_)
        | Instruction::ReturnValue => (1, 0),
        Instruction::Dup => (1, 2),
        Instruction::Dup2 => (2, 4),
        Instruction::Swap => (2, 2),
        Instruction::Add | Instruction::Sub => (2, 1),
        Instruction::GetField(_) => (1, 1),
        Instruction::PutField(_) => (2, 0),
        Instruction::InvokeStatic(m) => invoke(&m.descriptor, 0)?,
        Instruction::InvokeVirtual(m) | Instruction::InvokeSpecial(m) => {
            invoke(&m.descriptor, 1)?
        }
    })
}

/// Verify one method body. Returns the maximum stack depth reached.
pub fn verify_method(method: &MethodDef) -> Result<usize, VerifyError> {
    if method.code.is_empty() {
        return Err(VerifyError::EmptyBody);
    }
    let descriptor: MethodDescriptor =
        parse_method_descriptor(&method.descriptor).map_err(|_| VerifyError::BadDescriptor {
            descriptor: method.descriptor.clone(),
        })?;

    let len = method.code.len();
    let mut entry: Vec<Option<usize>> = vec![None; len];
    let mut worklist = vec![(0usize, 0usize)];
    let mut max_seen = 0usize;

    while let Some((pc, depth)) = worklist.pop() {
        match entry[pc] {
            Some(known) if known == depth => continue,
            Some(known) => {
                return Err(VerifyError::InconsistentStack {
                    pc,
                    expected: known,
                    found: depth,
                })
            }
            None => entry[pc] = Some(depth),
        }

        let instruction = &method.code[pc];
        match instruction {
            Instruction::Load(index) | Instruction::Store(index) if *index >= method.max_locals => {
                return Err(VerifyError::InvalidLocal { pc, index: *index });
            }
            Instruction::Return if descriptor.returns_value() => {
                return Err(VerifyError::ReturnMismatch { pc });
            }
            Instruction::ReturnValue if !descriptor.returns_value() => {
                return Err(VerifyError::ReturnMismatch { pc });
            }
            _ => {}
        }

        let (pops, pushes) = stack_effect(instruction)
            .map_err(|descriptor| VerifyError::BadDescriptor { descriptor })?;
        if depth < pops {
            return Err(VerifyError::StackUnderflow { pc });
        }
        let next_depth = depth - pops + pushes;
        // Dup/Dup2 briefly hold the copies on top of the originals.
        let peak = depth.max(next_depth);
        if peak > method.max_stack as usize {
            return Err(VerifyError::StackOverflow {
                pc,
                depth: peak,
                max: method.max_stack,
            });
        }
        max_seen = max_seen.max(peak);

        if let Some(target) = instruction.branch_target() {
            if target as usize >= len {
                return Err(VerifyError::JumpOutOfRange { pc, target });
            }
            worklist.push((target as usize, next_depth));
        }
        if !instruction.is_terminal() {
            if pc + 1 >= len {
                return Err(VerifyError::FallsOffEnd { pc });
            }
            worklist.push((pc + 1, next_depth));
        }
    }

    Ok(max_seen)
}

/// Verification verdict for one method.
#[derive(Debug, Clone, Serialize)]
pub struct MethodVerdict {
    pub name: String,
    pub descriptor: String,
    pub max_depth: Option<usize>,
    pub error: Option<VerifyError>,
}

impl MethodVerdict {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn signature(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }
}

/// Verification verdicts for a whole unit.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub type_name: String,
    pub methods: Vec<MethodVerdict>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.methods.iter().all(MethodVerdict::is_ok)
    }

    /// First failing method and its error.
    pub fn first_failure(&self) -> Option<(&MethodVerdict, &VerifyError)> {
        self.methods
            .iter()
            .find_map(|m| m.error.as_ref().map(|e| (m, e)))
    }
}

/// Verify every method of a unit.
pub fn verify_unit(unit: &CompiledUnit) -> VerifyReport {
    let methods = unit
        .methods
        .iter()
        .map(|method| {
            let result = verify_method(method);
            MethodVerdict {
                name: method.name.clone(),
                descriptor: method.descriptor.clone(),
                max_depth: result.as_ref().ok().copied(),
                error: result.err(),
            }
        })
        .collect();
    VerifyReport {
        type_name: unit.name.clone(),
        methods,
    }
}
