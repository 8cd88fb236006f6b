//! Error types for the auditing pipeline.
//!
//! Errors fall into three classes that are handled very differently:
//!
//! - **Resolution failures** ([`RewriteError::Resolution`]): a referenced type
//!   could not be resolved while building an exclusion profile. Soft: the unit
//!   is handed back unchanged.
//! - **Rewrite failures** ([`RewriteError::Verification`],
//!   [`RewriteError::Encode`]): the engine produced inconsistent output. Logged
//!   at error level; the original unit is handed back.
//! - **Violations** ([`AffinityViolation`]): domain output of the strict
//!   alternation policy, surfaced to the instrumented program as a failure of
//!   the offending thread.

use crate::verify::VerifyError;
use affinity_audit_types::{Category, DecodeError, FieldKey};
use std::fmt;

// =============================================================================
// Violations
// =============================================================================

/// An access that breaks a strict-alternation pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityViolation {
    pub key: FieldKey,
    /// Name of the offending thread (`<unnamed>` when it has none).
    pub thread: String,
    pub category: Category,
    /// Category the key is pinned to.
    pub pinned_to: Category,
    /// Thread that established the pin.
    pub pinned_by: String,
    pub is_read: bool,
}

impl fmt::Display for AffinityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} thread '{}' {} {} which is pinned to {} thread '{}'",
            self.category,
            self.thread,
            if self.is_read { "read" } else { "wrote" },
            self.key,
            self.pinned_to,
            self.pinned_by
        )
    }
}

impl std::error::Error for AffinityViolation {}

// =============================================================================
// Rewrite Errors
// =============================================================================

/// Failure to produce an instrumented unit.
#[derive(Debug, Clone)]
pub enum RewriteError {
    /// The raw unit could not be decoded.
    Decode(DecodeError),

    /// A type needed for exclusion decisions is not on the lookup path.
    Resolution {
        /// Type being rewritten.
        type_name: String,
        /// Type that could not be resolved.
        missing: String,
        /// Why resolution was needed (e.g. "supertype of com/model/Model").
        context: String,
    },

    /// The input unit does not verify, so there is nothing safe to rewrite.
    UnverifiableInput {
        type_name: String,
        method: String,
        error: VerifyError,
    },

    /// The emitted code failed verification although the input verified.
    Verification {
        type_name: String,
        method: String,
        error: VerifyError,
    },

    /// The rewritten unit could not be encoded.
    Encode { type_name: String, message: String },
}

impl RewriteError {
    /// Soft skip: the unit is returned unchanged without logging an error.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(self, RewriteError::Resolution { .. })
    }

    /// Engine defect: the unit is returned unchanged and the failure is logged.
    pub fn is_rewrite_failure(&self) -> bool {
        matches!(
            self,
            RewriteError::Verification { .. } | RewriteError::Encode { .. }
        )
    }

    pub fn type_name(&self) -> Option<&str> {
        match self {
            RewriteError::Decode(_) => None,
            RewriteError::Resolution { type_name, .. }
            | RewriteError::UnverifiableInput { type_name, .. }
            | RewriteError::Verification { type_name, .. }
            | RewriteError::Encode { type_name, .. } => Some(type_name),
        }
    }
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::Decode(e) => write!(f, "{}", e),
            RewriteError::Resolution {
                type_name,
                missing,
                context,
            } => write!(
                f,
                "cannot resolve {} ({}) while rewriting {}",
                missing, context, type_name
            ),
            RewriteError::UnverifiableInput {
                type_name,
                method,
                error,
            } => write!(
                f,
                "input {}.{} does not verify: {}",
                type_name, method, error
            ),
            RewriteError::Verification {
                type_name,
                method,
                error,
            } => write!(
                f,
                "rewritten {}.{} failed verification: {}",
                type_name, method, error
            ),
            RewriteError::Encode { type_name, message } => {
                write!(f, "failed to encode rewritten {}: {}", type_name, message)
            }
        }
    }
}

impl std::error::Error for RewriteError {}

impl From<DecodeError> for RewriteError {
    fn from(e: DecodeError) -> Self {
        RewriteError::Decode(e)
    }
}

// =============================================================================
// Execution Errors
// =============================================================================

/// Failure while running units in the sandbox.
#[derive(Debug, Clone)]
pub enum ExecutionError {
    /// The type is not loaded into the sandbox.
    UnknownType(String),

    MethodNotFound {
        owner: String,
        name: String,
        descriptor: String,
    },

    FieldNotFound { owner: String, field: String },

    /// Dereferenced a null value.
    NullReference { context: String },

    /// An operand had the wrong shape.
    TypeMismatch {
        expected: &'static str,
        got: String,
        context: String,
    },

    /// Popped an empty operand stack.
    StackUnderflow { method: String, pc: usize },

    InvalidLocal { method: String, index: u16 },

    /// Fell off the end of a body or jumped outside it.
    InvalidPc { method: String, pc: usize },

    /// Type initialization failed earlier; the type is unusable.
    InitializationFailed { type_name: String, message: String },

    /// Execution exceeded the configured instruction budget.
    StepLimitExceeded { limit: u64 },

    /// Managed call nesting exceeded the configured depth.
    CallDepthExceeded { limit: usize },

    /// A strict-alternation violation aborted the thread.
    Violation(AffinityViolation),

    /// Host-level panic on a sandbox thread.
    ThreadPanicked { thread: String },
}

impl ExecutionError {
    pub fn is_violation(&self) -> bool {
        matches!(self, ExecutionError::Violation(_))
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::UnknownType(name) => write!(f, "unknown type {}", name),
            ExecutionError::MethodNotFound {
                owner,
                name,
                descriptor,
            } => write!(f, "method {}.{}{} not found", owner, name, descriptor),
            ExecutionError::FieldNotFound { owner, field } => {
                write!(f, "field {}.{} not found", owner, field)
            }
            ExecutionError::NullReference { context } => {
                write!(f, "null reference in {}", context)
            }
            ExecutionError::TypeMismatch {
                expected,
                got,
                context,
            } => write!(f, "expected {} but got {} in {}", expected, got, context),
            ExecutionError::StackUnderflow { method, pc } => {
                write!(f, "operand stack underflow in {} at pc {}", method, pc)
            }
            ExecutionError::InvalidLocal { method, index } => {
                write!(f, "invalid local {} in {}", index, method)
            }
            ExecutionError::InvalidPc { method, pc } => {
                write!(f, "invalid pc {} in {}", pc, method)
            }
            ExecutionError::InitializationFailed { type_name, message } => {
                write!(f, "initialization of {} failed: {}", type_name, message)
            }
            ExecutionError::StepLimitExceeded { limit } => {
                write!(f, "step limit of {} instructions exceeded", limit)
            }
            ExecutionError::CallDepthExceeded { limit } => {
                write!(f, "call depth of {} frames exceeded", limit)
            }
            ExecutionError::Violation(v) => write!(f, "affinity violation: {}", v),
            ExecutionError::ThreadPanicked { thread } => {
                write!(f, "sandbox thread '{}' panicked", thread)
            }
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<AffinityViolation> for ExecutionError {
    fn from(v: AffinityViolation) -> Self {
        ExecutionError::Violation(v)
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid configuration {}='{}': {}",
            self.key, self.value, self.reason
        )
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use affinity_audit_types::ReceiverId;

    #[test]
    fn test_violation_message() {
        let v = AffinityViolation {
            key: FieldKey::instance("com/model/Model", "value", ReceiverId(3)),
            thread: "Worker-1".into(),
            category: Category::Other,
            pinned_to: Category::Owner,
            pinned_by: "RSM-Thread-1".into(),
            is_read: false,
        };
        assert_eq!(
            v.to_string(),
            "OTHER thread 'Worker-1' wrote 3.com/model/Model.value which is pinned to OWNER thread 'RSM-Thread-1'"
        );
        assert!(ExecutionError::from(v).is_violation());
    }

    #[test]
    fn test_rewrite_error_classes() {
        let resolution = RewriteError::Resolution {
            type_name: "com/model/Model".into(),
            missing: "com/model/Base".into(),
            context: "supertype of com/model/Model".into(),
        };
        assert!(resolution.is_resolution_failure());
        assert!(!resolution.is_rewrite_failure());
        assert_eq!(resolution.type_name(), Some("com/model/Model"));
        assert!(resolution.to_string().contains("com/model/Base"));

        let encode = RewriteError::Encode {
            type_name: "a/B".into(),
            message: "boom".into(),
        };
        assert!(encode.is_rewrite_failure());
    }
}
