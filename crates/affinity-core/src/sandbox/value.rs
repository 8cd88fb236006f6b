//! Runtime values of the sandbox.

use crate::errors::ExecutionError;
use affinity_audit_types::ReceiverId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Heap object handle. Doubles as the ledger's receiver identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub fn receiver(self) -> ReceiverId {
        ReceiverId(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(Arc<str>),
    Null,
    Ref(ObjectId),
    /// Handle of a sandbox thread.
    Thread(u64),
}

impl Value {
    /// Zero value of a field descriptor.
    pub fn default_for(descriptor: &str) -> Value {
        match descriptor {
            "I" | "J" | "S" | "B" | "C" => Value::Int(0),
            "Z" => Value::Bool(false),
            _ => Value::Null,
        }
    }

    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Null => "null",
            Value::Ref(_) => "object",
            Value::Thread(_) => "thread",
        }
    }

    pub fn as_int(&self, context: &str) -> Result<i64, ExecutionError> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(mismatch("int", other, context)),
        }
    }

    pub fn as_bool(&self, context: &str) -> Result<bool, ExecutionError> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(mismatch("bool", other, context)),
        }
    }

    pub fn as_str(&self, context: &str) -> Result<&str, ExecutionError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(mismatch("string", other, context)),
        }
    }

    /// Object handle; `Null` is a null reference, anything else a mismatch.
    pub fn as_object(&self, context: &str) -> Result<ObjectId, ExecutionError> {
        match self {
            Value::Ref(id) => Ok(*id),
            Value::Null => Err(ExecutionError::NullReference {
                context: context.to_string(),
            }),
            other => Err(mismatch("object", other, context)),
        }
    }

    /// Branch condition: ints, bools and null are tested against zero.
    pub fn is_zero(&self, context: &str) -> Result<bool, ExecutionError> {
        match self {
            Value::Int(v) => Ok(*v == 0),
            Value::Bool(v) => Ok(!*v),
            Value::Null => Ok(true),
            other => Err(mismatch("int", other, context)),
        }
    }
}

fn mismatch(expected: &'static str, got: &Value, context: &str) -> ExecutionError {
    ExecutionError::TypeMismatch {
        expected,
        got: got.type_label().to_string(),
        context: context.to_string(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Null => write!(f, "null"),
            Value::Ref(id) => write!(f, "{}", id),
            Value::Thread(id) => write!(f, "thread#{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_by_descriptor() {
        assert_eq!(Value::default_for("I"), Value::Int(0));
        assert_eq!(Value::default_for("Z"), Value::Bool(false));
        assert_eq!(Value::default_for("Ljava/lang/String;"), Value::Null);
    }

    #[test]
    fn test_null_object_is_null_reference() {
        let err = Value::Null.as_object("getValue").unwrap_err();
        assert!(matches!(err, ExecutionError::NullReference { .. }));
        let err = Value::Int(1).as_object("getValue").unwrap_err();
        assert!(matches!(err, ExecutionError::TypeMismatch { expected: "object", .. }));
    }

    #[test]
    fn test_branch_conditions() {
        assert!(Value::Int(0).is_zero("t").unwrap());
        assert!(!Value::Bool(true).is_zero("t").unwrap());
        assert!(Value::str("x").is_zero("t").is_err());
    }
}
