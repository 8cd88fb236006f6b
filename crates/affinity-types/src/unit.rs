//! Compiled unit model.
//!
//! A [`CompiledUnit`] is the load-time artifact the rewrite engine consumes and
//! produces: one named type with its declared markers, fields and methods. Method
//! bodies are flat instruction lists for a small operand-stack machine; branch
//! targets are absolute instruction indices.
//!
//! ## Layout
//!
//! ```text
//! CompiledUnit
//! ├── name / super_name          "com/model/Model", "com/model/Base"
//! ├── annotations                declared markers (type names)
//! ├── fields[]                   FieldDef { name, descriptor, is_static, is_final, annotations }
//! └── methods[]                  MethodDef { name, descriptor, is_static, annotations,
//!                                            max_stack, max_locals, code[] }
//! ```
//!
//! The serialized form is stable for both BCS (raw units handed over by the
//! loader) and JSON (tooling and fixtures), so no field here may be skipped
//! during serialization.

use serde::{Deserialize, Serialize};

/// Name of the construction routine.
pub const CONSTRUCTOR_NAME: &str = "<init>";

/// Name of the static-initialization routine.
pub const STATIC_INIT_NAME: &str = "<clinit>";

/// Namespace reserved for the auditing runtime itself.
pub const RUNTIME_NAMESPACE: &str = "affinity/";

/// Marker vocabulary, expressed as annotation type names.
pub mod markers {
    /// Full exemption (class, field or method granularity).
    pub const EXCLUDED: &str = "affinity/annotation/Excluded";
    /// Owner threads may read values written by Other threads (field).
    pub const ALLOW_CROSS_CATEGORY_READ: &str = "affinity/annotation/AllowCrossCategoryRead";
    /// Writes recorded during type initialization never produce findings (field).
    pub const IGNORE_DURING_INIT: &str = "affinity/annotation/IgnoreDuringInit";
    /// Accesses inside construction/static-initialization routines are tracked (field).
    pub const TRACK_INIT_WRITES: &str = "affinity/annotation/TrackInitWrites";
}

/// One type as handed over by the loading collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledUnit {
    /// Slash-separated type name, e.g. `com/model/Model`.
    pub name: String,
    /// Direct supertype, if any.
    #[serde(default)]
    pub super_name: Option<String>,
    /// Annotation type names declared on the type.
    #[serde(default)]
    pub annotations: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

impl CompiledUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_name: None,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Look up a declared field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a declared method by name and descriptor.
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodDef> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn has_annotation(&self, type_name: &str) -> bool {
        self.annotations.iter().any(|a| a == type_name)
    }

    /// Package part of the type name (`com/model` for `com/model/Model`).
    pub fn package(&self) -> &str {
        match self.name.rfind('/') {
            Some(idx) => &self.name[..idx],
            None => "",
        }
    }

    /// Total number of instructions across all method bodies.
    pub fn instruction_count(&self) -> usize {
        self.methods.iter().map(|m| m.code.len()).sum()
    }
}

/// A declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// Value descriptor (`I`, `Z`, `Ljava/lang/String;`, ...).
    pub descriptor: String,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub annotations: Vec<String>,
}

impl FieldDef {
    pub fn has_annotation(&self, type_name: &str) -> bool {
        self.annotations.iter().any(|a| a == type_name)
    }
}

/// A declared method with its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    /// Method descriptor, e.g. `(I)V`.
    pub descriptor: String,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub annotations: Vec<String>,
    /// Maximum operand stack depth the body may reach.
    pub max_stack: u16,
    /// Number of local slots, including the receiver and parameters.
    pub max_locals: u16,
    #[serde(default)]
    pub code: Vec<Instruction>,
}

impl MethodDef {
    pub fn has_annotation(&self, type_name: &str) -> bool {
        self.annotations.iter().any(|a| a == type_name)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR_NAME
    }

    pub fn is_static_init(&self) -> bool {
        self.name == STATIC_INIT_NAME
    }

    /// Construction routine or static initializer.
    pub fn is_initializer(&self) -> bool {
        self.is_constructor() || self.is_static_init()
    }
}

/// Symbolic reference to a field, as it appears in an access instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    /// Statically determined owner type.
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl FieldRef {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

impl std::fmt::Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}:{}", self.owner, self.name, self.descriptor)
    }
}

/// Symbolic reference to a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MethodRef {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

impl std::fmt::Display for MethodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// Operand-stack machine instructions.
///
/// Branch targets (`Goto`, `IfZero`, `IfNonZero`) are absolute indices into the
/// enclosing method's `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    Nop,
    PushInt(i64),
    PushBool(bool),
    PushStr(String),
    PushNull,
    Load(u16),
    Store(u16),
    Dup,
    /// Duplicate the top two values, preserving order.
    Dup2,
    Pop,
    Swap,
    Add,
    Sub,
    Goto(u32),
    /// Pop an int/bool; branch when it is zero/false.
    IfZero(u32),
    /// Pop an int/bool; branch when it is non-zero/true.
    IfNonZero(u32),
    /// Allocate an uninitialized instance (the constructor is invoked separately).
    New(String),
    GetField(FieldRef),
    PutField(FieldRef),
    GetStatic(FieldRef),
    PutStatic(FieldRef),
    InvokeStatic(MethodRef),
    InvokeVirtual(MethodRef),
    InvokeSpecial(MethodRef),
    /// Push the handle of the executing thread.
    CurrentThread,
    Return,
    ReturnValue,
}

impl Instruction {
    /// Field reference and access kind when this is a field access.
    pub fn field_access(&self) -> Option<(&FieldRef, FieldAccessKind)> {
        match self {
            Instruction::GetField(r) => Some((r, FieldAccessKind::InstanceRead)),
            Instruction::PutField(r) => Some((r, FieldAccessKind::InstanceWrite)),
            Instruction::GetStatic(r) => Some((r, FieldAccessKind::StaticRead)),
            Instruction::PutStatic(r) => Some((r, FieldAccessKind::StaticWrite)),
            _ => None,
        }
    }

    /// Branch target, if this instruction can transfer control.
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Instruction::Goto(t) | Instruction::IfZero(t) | Instruction::IfNonZero(t) => Some(*t),
            _ => None,
        }
    }

    /// Same instruction with its branch target replaced.
    pub fn with_branch_target(&self, target: u32) -> Instruction {
        match self {
            Instruction::Goto(_) => Instruction::Goto(target),
            Instruction::IfZero(_) => Instruction::IfZero(target),
            Instruction::IfNonZero(_) => Instruction::IfNonZero(target),
            other => other.clone(),
        }
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Instruction::Goto(_) | Instruction::Return | Instruction::ReturnValue
        )
    }
}

/// The four kinds of field access the rewrite engine instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldAccessKind {
    InstanceRead,
    InstanceWrite,
    StaticRead,
    StaticWrite,
}

impl FieldAccessKind {
    pub fn is_read(self) -> bool {
        matches!(self, Self::InstanceRead | Self::StaticRead)
    }

    pub fn is_static(self) -> bool {
        matches!(self, Self::StaticRead | Self::StaticWrite)
    }
}
