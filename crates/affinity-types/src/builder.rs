//! Fluent construction of compiled units.
//!
//! Used by tests, demos and tooling that synthesize units in code rather than
//! loading them from disk.
//!
//! ```
//! use affinity_audit_types::builder::{MethodBuilder, UnitBuilder};
//! use affinity_audit_types::unit::{FieldRef, Instruction};
//!
//! let value = FieldRef::new("com/model/Model", "value", "I");
//! let unit = UnitBuilder::new("com/model/Model")
//!     .field("value", "I")
//!     .method(
//!         MethodBuilder::new("getValue", "()I")
//!             .op(Instruction::Load(0))
//!             .op(Instruction::GetField(value))
//!             .op(Instruction::ReturnValue),
//!     )
//!     .build();
//! assert_eq!(unit.methods[0].max_locals, 1);
//! ```

use crate::descriptor::parse_method_descriptor;
use crate::unit::{CompiledUnit, FieldDef, Instruction, MethodDef};

/// Default operand stack headroom for built methods.
pub const DEFAULT_MAX_STACK: u16 = 8;

/// Builder for [`CompiledUnit`].
#[derive(Debug, Clone)]
pub struct UnitBuilder {
    unit: CompiledUnit,
}

impl UnitBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            unit: CompiledUnit::new(name),
        }
    }

    pub fn extends(mut self, super_name: impl Into<String>) -> Self {
        self.unit.super_name = Some(super_name.into());
        self
    }

    pub fn annotate(mut self, marker: &str) -> Self {
        self.unit.annotations.push(marker.to_string());
        self
    }

    /// Plain mutable instance field.
    pub fn field(self, name: &str, descriptor: &str) -> Self {
        self.field_with(name, descriptor, false, false, &[])
    }

    /// Plain mutable static field.
    pub fn static_field(self, name: &str, descriptor: &str) -> Self {
        self.field_with(name, descriptor, true, false, &[])
    }

    pub fn field_with(
        mut self,
        name: &str,
        descriptor: &str,
        is_static: bool,
        is_final: bool,
        annotations: &[&str],
    ) -> Self {
        self.unit.fields.push(FieldDef {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_static,
            is_final,
            annotations: annotations.iter().map(|a| a.to_string()).collect(),
        });
        self
    }

    pub fn method(mut self, method: MethodBuilder) -> Self {
        self.unit.methods.push(method.build());
        self
    }

    pub fn build(self) -> CompiledUnit {
        self.unit
    }
}

/// Builder for [`MethodDef`].
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    method: MethodDef,
    explicit_locals: bool,
}

impl MethodBuilder {
    /// Instance method.
    pub fn new(name: &str, descriptor: &str) -> Self {
        Self {
            method: MethodDef {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                is_static: false,
                annotations: Vec::new(),
                max_stack: DEFAULT_MAX_STACK,
                max_locals: 0,
                code: Vec::new(),
            },
            explicit_locals: false,
        }
    }

    /// Static method.
    pub fn new_static(name: &str, descriptor: &str) -> Self {
        let mut builder = Self::new(name, descriptor);
        builder.method.is_static = true;
        builder
    }

    pub fn annotate(mut self, marker: &str) -> Self {
        self.method.annotations.push(marker.to_string());
        self
    }

    pub fn max_stack(mut self, max_stack: u16) -> Self {
        self.method.max_stack = max_stack;
        self
    }

    pub fn max_locals(mut self, max_locals: u16) -> Self {
        self.method.max_locals = max_locals;
        self.explicit_locals = true;
        self
    }

    pub fn op(mut self, instruction: Instruction) -> Self {
        self.method.code.push(instruction);
        self
    }

    pub fn ops(mut self, instructions: impl IntoIterator<Item = Instruction>) -> Self {
        self.method.code.extend(instructions);
        self
    }

    /// Finish the method. Unless set explicitly, `max_locals` covers the
    /// receiver and declared parameters.
    pub fn build(mut self) -> MethodDef {
        if !self.explicit_locals {
            let params = parse_method_descriptor(&self.method.descriptor)
                .map(|d| d.param_count())
                .unwrap_or(0);
            let receiver = usize::from(!self.method.is_static);
            self.method.max_locals = (params + receiver) as u16;
        }
        self.method
    }
}
