//! Instruction interpreter.
//!
//! Each managed call runs in its own Rust frame; the operand stack and locals
//! live in that frame, the call stack shown to the ledger lives in the
//! [`ExecThread`].

use super::natives::NativeContext;
use super::thread::ExecThread;
use super::value::{ObjectId, Value};
use super::Sandbox;
use super::heap::InitTicket;
use crate::errors::ExecutionError;
use affinity_audit_types::descriptor::parse_method_descriptor;
use affinity_audit_types::unit::CONSTRUCTOR_NAME;
use affinity_audit_types::{CompiledUnit, FieldRef, Instruction, MethodDef, MethodRef};
use std::sync::Arc;
use tracing::{debug, warn};

type CallResult = Result<Option<Value>, ExecutionError>;

impl Sandbox {
    // =========================================================================
    // Invocation
    // =========================================================================

    /// Run method `idx` of `unit` with `args` (receiver first for instance methods).
    pub(crate) fn call(
        &self,
        thread: &mut ExecThread,
        unit: &Arc<CompiledUnit>,
        idx: usize,
        args: Vec<Value>,
    ) -> CallResult {
        let limit = self.config().max_call_depth;
        if thread.depth() >= limit {
            return Err(ExecutionError::CallDepthExceeded { limit });
        }
        let Some(method) = unit.methods.get(idx) else {
            return Err(ExecutionError::MethodNotFound {
                owner: unit.name.clone(),
                name: format!("#{}", idx),
                descriptor: String::new(),
            });
        };
        thread.push_frame(&unit.name, &method.name, &method.descriptor);
        let result = self.run_frame(thread, unit, method, args);
        thread.pop_frame();
        result
    }

    pub(crate) fn invoke_static_ref(
        &self,
        thread: &mut ExecThread,
        target: &MethodRef,
        args: Vec<Value>,
    ) -> CallResult {
        if let Some(native) = self.natives().get(&target.owner, &target.name) {
            return native(&NativeContext { thread: &*thread }, args);
        }
        self.ensure_initialized(thread, &target.owner)?;
        let (unit, idx) = self
            .find_method(&target.owner, &target.name, &target.descriptor)
            .ok_or_else(|| not_found(target))?;
        self.call(thread, &unit, idx, args)
    }

    /// Non-virtual instance call: constructors and explicit supertype calls.
    pub(crate) fn invoke_special_ref(
        &self,
        thread: &mut ExecThread,
        target: &MethodRef,
        receiver: Value,
        args: Vec<Value>,
    ) -> CallResult {
        receiver.as_object(&target.to_string())?;
        if let Some(native) = self.natives().get(&target.owner, &target.name) {
            return native(&NativeContext { thread: &*thread }, args);
        }
        match self.find_method(&target.owner, &target.name, &target.descriptor) {
            Some((unit, idx)) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(receiver);
                full.extend(args);
                self.call(thread, &unit, idx, full)
            }
            // Types without a declared no-argument constructor get an empty one.
            None if target.name == CONSTRUCTOR_NAME && target.descriptor == "()V" => Ok(None),
            None => Err(not_found(target)),
        }
    }

    pub(crate) fn invoke_virtual_ref(
        &self,
        thread: &mut ExecThread,
        target: &MethodRef,
        receiver: Value,
        args: Vec<Value>,
    ) -> CallResult {
        let id = receiver.as_object(&target.to_string())?;
        let runtime_type = self.object_type(id)?;
        let (unit, idx) = self
            .find_method(&runtime_type, &target.name, &target.descriptor)
            .ok_or_else(|| ExecutionError::MethodNotFound {
                owner: runtime_type.clone(),
                name: target.name.clone(),
                descriptor: target.descriptor.clone(),
            })?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(receiver);
        full.extend(args);
        self.call(thread, &unit, idx, full)
    }

    /// Run `<clinit>` of `type_name` (and its supertypes) once. Types unknown to
    /// the sandbox need no initialization.
    pub(crate) fn ensure_initialized(
        &self,
        thread: &mut ExecThread,
        type_name: &str,
    ) -> Result<(), ExecutionError> {
        let Some(unit) = self.unit(type_name) else {
            return Ok(());
        };
        match self.init_table().begin(type_name, thread.id())? {
            InitTicket::Ready => Ok(()),
            InitTicket::Run => {
                let result = self.run_initializers(thread, &unit);
                self.init_table()
                    .finish(type_name, result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
                match &result {
                    Ok(()) => debug!(type_name, thread = thread.display_name(), "type initialized"),
                    Err(e) => warn!(type_name, error = %e, "type initialization failed"),
                }
                result
            }
        }
    }

    fn run_initializers(
        &self,
        thread: &mut ExecThread,
        unit: &Arc<CompiledUnit>,
    ) -> Result<(), ExecutionError> {
        if let Some(super_name) = &unit.super_name {
            self.ensure_initialized(thread, super_name)?;
        }
        if let Some(idx) = unit.methods.iter().position(MethodDef::is_static_init) {
            self.call(thread, unit, idx, Vec::new())?;
        }
        Ok(())
    }

    // =========================================================================
    // Frame Execution
    // =========================================================================

    fn run_frame(
        &self,
        thread: &mut ExecThread,
        unit: &CompiledUnit,
        method: &MethodDef,
        args: Vec<Value>,
    ) -> CallResult {
        let label = || format!("{}.{}{}", unit.name, method.name, method.descriptor);
        let mut locals = vec![Value::Null; usize::from(method.max_locals).max(args.len())];
        for (slot, arg) in locals.iter_mut().zip(args) {
            *slot = arg;
        }
        let mut stack: Vec<Value> = Vec::with_capacity(usize::from(method.max_stack));
        let step_limit = self.config().step_limit;
        let mut pc = 0usize;

        loop {
            let instruction = method
                .code
                .get(pc)
                .ok_or_else(|| ExecutionError::InvalidPc { method: label(), pc })?;
            if thread.step(pc) > step_limit {
                return Err(ExecutionError::StepLimitExceeded { limit: step_limit });
            }
            let underflow = || ExecutionError::StackUnderflow { method: label(), pc };
            let mut next = pc + 1;

            match instruction {
                Instruction::Nop => {}
                Instruction::PushInt(v) => stack.push(Value::Int(*v)),
                Instruction::PushBool(v) => stack.push(Value::Bool(*v)),
                Instruction::PushStr(s) => stack.push(Value::str(s)),
                Instruction::PushNull => stack.push(Value::Null),
                Instruction::Load(index) => {
                    let value = locals.get(usize::from(*index)).cloned().ok_or_else(|| {
                        ExecutionError::InvalidLocal {
                            method: label(),
                            index: *index,
                        }
                    })?;
                    stack.push(value);
                }
                Instruction::Store(index) => {
                    let value = stack.pop().ok_or_else(underflow)?;
                    let slot = locals.get_mut(usize::from(*index)).ok_or_else(|| {
                        ExecutionError::InvalidLocal {
                            method: label(),
                            index: *index,
                        }
                    })?;
                    *slot = value;
                }
                Instruction::Dup => {
                    let top = stack.last().cloned().ok_or_else(underflow)?;
                    stack.push(top);
                }
                Instruction::Dup2 => {
                    if stack.len() < 2 {
                        return Err(underflow());
                    }
                    let pair = stack[stack.len() - 2..].to_vec();
                    stack.extend(pair);
                }
                Instruction::Pop => {
                    stack.pop().ok_or_else(underflow)?;
                }
                Instruction::Swap => {
                    let len = stack.len();
                    if len < 2 {
                        return Err(underflow());
                    }
                    stack.swap(len - 1, len - 2);
                }
                Instruction::Add | Instruction::Sub => {
                    let b = stack.pop().ok_or_else(underflow)?.as_int(&label())?;
                    let a = stack.pop().ok_or_else(underflow)?.as_int(&label())?;
                    stack.push(Value::Int(match instruction {
                        Instruction::Add => a.wrapping_add(b),
                        _ => a.wrapping_sub(b),
                    }));
                }
                Instruction::Goto(target) => next = *target as usize,
                Instruction::IfZero(target) => {
                    if stack.pop().ok_or_else(underflow)?.is_zero(&label())? {
                        next = *target as usize;
                    }
                }
                Instruction::IfNonZero(target) => {
                    if !stack.pop().ok_or_else(underflow)?.is_zero(&label())? {
                        next = *target as usize;
                    }
                }
                Instruction::New(type_name) => {
                    let id = self.allocate(thread, type_name)?;
                    stack.push(Value::Ref(id));
                }
                Instruction::GetField(field) => {
                    let receiver = stack.pop().ok_or_else(underflow)?;
                    let id = receiver.as_object(&field.to_string())?;
                    stack.push(self.read_field(id, field)?);
                }
                Instruction::PutField(field) => {
                    let value = stack.pop().ok_or_else(underflow)?;
                    let receiver = stack.pop().ok_or_else(underflow)?;
                    let id = receiver.as_object(&field.to_string())?;
                    self.write_field(id, field, value)?;
                }
                Instruction::GetStatic(field) => {
                    let owner = self.declaring_type(field)?;
                    self.ensure_initialized(thread, &owner)?;
                    let value = self
                        .heap()
                        .get_static(&owner, &field.name)
                        .unwrap_or_else(|| Value::default_for(&field.descriptor));
                    stack.push(value);
                }
                Instruction::PutStatic(field) => {
                    let value = stack.pop().ok_or_else(underflow)?;
                    let owner = self.declaring_type(field)?;
                    self.ensure_initialized(thread, &owner)?;
                    self.heap().set_static(&owner, &field.name, value);
                }
                Instruction::InvokeStatic(target) => {
                    let args = pop_args(&mut stack, param_count(target)?, underflow)?;
                    if let Some(value) = self.invoke_static_ref(thread, target, args)? {
                        stack.push(value);
                    }
                }
                Instruction::InvokeVirtual(target) | Instruction::InvokeSpecial(target) => {
                    let args = pop_args(&mut stack, param_count(target)?, underflow)?;
                    let receiver = stack.pop().ok_or_else(underflow)?;
                    let result = if matches!(instruction, Instruction::InvokeVirtual(_)) {
                        self.invoke_virtual_ref(thread, target, receiver, args)?
                    } else {
                        self.invoke_special_ref(thread, target, receiver, args)?
                    };
                    if let Some(value) = result {
                        stack.push(value);
                    }
                }
                Instruction::CurrentThread => stack.push(Value::Thread(thread.id())),
                Instruction::Return => return Ok(None),
                Instruction::ReturnValue => {
                    return Ok(Some(stack.pop().ok_or_else(underflow)?));
                }
            }
            pc = next;
        }
    }

    // =========================================================================
    // Storage
    // =========================================================================

    pub(crate) fn allocate(
        &self,
        thread: &mut ExecThread,
        type_name: &str,
    ) -> Result<ObjectId, ExecutionError> {
        if self.unit(type_name).is_none() {
            return Err(ExecutionError::UnknownType(type_name.to_string()));
        }
        self.ensure_initialized(thread, type_name)?;
        Ok(self.heap().allocate(type_name).id)
    }

    /// Type declaring `field`, walking loaded supertypes from its static owner.
    pub(crate) fn declaring_type(&self, field: &FieldRef) -> Result<String, ExecutionError> {
        let mut next = Some(field.owner.clone());
        let mut seen_any = false;
        while let Some(type_name) = next {
            let Some(unit) = self.unit(&type_name) else {
                break;
            };
            seen_any = true;
            if unit.field(&field.name).is_some() {
                return Ok(unit.name.clone());
            }
            next = unit.super_name.clone();
        }
        if seen_any {
            Err(ExecutionError::FieldNotFound {
                owner: field.owner.clone(),
                field: field.name.clone(),
            })
        } else {
            Err(ExecutionError::UnknownType(field.owner.clone()))
        }
    }

    fn read_field(&self, id: ObjectId, field: &FieldRef) -> Result<Value, ExecutionError> {
        let owner = self.declaring_type(field)?;
        let object = self.object(id)?;
        Ok(object
            .get(&owner, &field.name)
            .unwrap_or_else(|| Value::default_for(&field.descriptor)))
    }

    fn write_field(&self, id: ObjectId, field: &FieldRef, value: Value) -> Result<(), ExecutionError> {
        let owner = self.declaring_type(field)?;
        self.object(id)?.set(&owner, &field.name, value);
        Ok(())
    }
}

fn not_found(target: &MethodRef) -> ExecutionError {
    ExecutionError::MethodNotFound {
        owner: target.owner.clone(),
        name: target.name.clone(),
        descriptor: target.descriptor.clone(),
    }
}

fn param_count(target: &MethodRef) -> Result<usize, ExecutionError> {
    parse_method_descriptor(&target.descriptor)
        .map(|d| d.param_count())
        .map_err(|e| ExecutionError::TypeMismatch {
            expected: "method descriptor",
            got: e.to_string(),
            context: target.to_string(),
        })
}

fn pop_args(
    stack: &mut Vec<Value>,
    count: usize,
    underflow: impl Fn() -> ExecutionError,
) -> Result<Vec<Value>, ExecutionError> {
    if stack.len() < count {
        return Err(underflow());
    }
    Ok(stack.split_off(stack.len() - count))
}
