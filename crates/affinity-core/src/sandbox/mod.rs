//! # Sandbox Runtime
//!
//! A small multi-threaded interpreter for compiled units, used to run audited
//! programs end to end: units are defined through the [`LoaderHook`] exactly as
//! a host runtime would define them, and the inserted checks reach the ledger
//! through the native `affinity/runtime/AccessLedger.observe`.
//!
//! ## Semantics
//!
//! | Concern | Behavior |
//! |---------|----------|
//! | Values | int, bool, string, null, object reference, thread handle |
//! | Fields | per-object storage keyed by declaring type; statics per type |
//! | Initialization | `<clinit>` on first `new`, static access or static call, on the triggering thread; concurrent triggers wait |
//! | Dispatch | static and special calls bind to the named owner, virtual calls to the receiver's type; both walk supertypes |
//! | Failures | a thread stops at the first [`ExecutionError`]; a ledger violation is one |
//!
//! ## Example
//!
//! ```
//! use affinity_audit_core::config::AuditConfig;
//! use affinity_audit_core::ledger::build_ledger;
//! use affinity_audit_core::sandbox::{Sandbox, SandboxConfig, Value};
//! use affinity_audit_core::sink::FindingReporter;
//! use affinity_audit_types::builder::{MethodBuilder, UnitBuilder};
//! use affinity_audit_types::Instruction;
//!
//! let ledger = build_ledger(&AuditConfig::default(), FindingReporter::new());
//! let sandbox = Sandbox::new(ledger, SandboxConfig::default());
//! sandbox.define(
//!     UnitBuilder::new("com/model/Math")
//!         .method(
//!             MethodBuilder::new_static("inc", "(I)I")
//!                 .op(Instruction::Load(0))
//!                 .op(Instruction::PushInt(1))
//!                 .op(Instruction::Add)
//!                 .op(Instruction::ReturnValue),
//!         )
//!         .build(),
//! );
//! let mut thread = sandbox.new_thread(Some("main"));
//! let result = sandbox
//!     .invoke_static(&mut thread, "com/model/Math", "inc", "(I)I", vec![Value::Int(41)])
//!     .unwrap();
//! assert_eq!(result, Some(Value::Int(42)));
//! ```

mod heap;
mod interpreter;
mod natives;
mod thread;
mod value;

pub use heap::{Heap, HeapObject};
pub use natives::{
    build_native_function_table, NativeContext, NativeFunction, NativeFunctionTable,
    DEBUG_OWNER, ROOT_TYPE, THREADS_OWNER,
};
pub use thread::ExecThread;
pub use value::{ObjectId, Value};

use crate::errors::ExecutionError;
use crate::ledger::AccessLedger;
use crate::loader::{LoaderHook, TransformOutcome};
use affinity_audit_types::unit::CONSTRUCTOR_NAME;
use affinity_audit_types::{decode_unit, encode_unit, CompiledUnit, FieldRef, MethodRef};
use anyhow::{anyhow, Context, Result};
use heap::InitTable;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Default instruction budget per sandbox thread.
pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

/// Default maximum managed call depth.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Execution limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub step_limit: u64,
    pub max_call_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            step_limit: DEFAULT_STEP_LIMIT,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl SandboxConfig {
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }
}

/// How one unit entered the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedUnit {
    pub name: String,
    pub rewritten: bool,
    /// Why the unit was left unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Interpreter state shared by all sandbox threads.
pub struct Sandbox {
    units: RwLock<HashMap<String, Arc<CompiledUnit>>>,
    heap: Heap,
    init: InitTable,
    natives: NativeFunctionTable,
    ledger: Arc<dyn AccessLedger>,
    config: SandboxConfig,
    next_thread: AtomicU64,
}

impl Sandbox {
    pub fn new(ledger: Arc<dyn AccessLedger>, config: SandboxConfig) -> Self {
        Self {
            units: RwLock::new(HashMap::new()),
            heap: Heap::new(),
            init: InitTable::new(),
            natives: build_native_function_table(ledger.clone()),
            ledger,
            config,
            next_thread: AtomicU64::new(1),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn AccessLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn natives(&self) -> &NativeFunctionTable {
        &self.natives
    }

    pub(crate) fn init_table(&self) -> &InitTable {
        &self.init
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Define a unit as-is (already rewritten or deliberately uninstrumented).
    pub fn define(&self, unit: CompiledUnit) -> Arc<CompiledUnit> {
        let unit = Arc::new(unit);
        self.units.write().insert(unit.name.clone(), unit.clone());
        unit
    }

    /// Define `units` through the loader hook. Every unit is put on the hook's
    /// lookup path first, so definition order does not matter for resolution.
    pub fn load_through(&self, hook: &LoaderHook, units: Vec<CompiledUnit>) -> Result<Vec<LoadedUnit>> {
        for unit in &units {
            hook.lookup().register(unit.clone());
        }
        let mut loaded = Vec::with_capacity(units.len());
        for unit in units {
            let raw = encode_unit(&unit).with_context(|| format!("Failed to encode {}", unit.name))?;
            let entry = match hook.transform(&unit.name, &raw) {
                TransformOutcome::Rewritten(bytes) => {
                    let rewritten = decode_unit(&bytes)
                        .map_err(|e| anyhow!("Rewritten {} does not decode: {}", unit.name, e))?;
                    self.define(rewritten);
                    LoadedUnit {
                        name: unit.name,
                        rewritten: true,
                        reason: None,
                    }
                }
                TransformOutcome::Unchanged(reason) => {
                    debug!(type_name = %unit.name, reason = %reason, "defined unchanged");
                    let name = unit.name.clone();
                    self.define(unit);
                    LoadedUnit {
                        name,
                        rewritten: false,
                        reason: Some(reason.to_string()),
                    }
                }
            };
            loaded.push(entry);
        }
        info!(
            units = loaded.len(),
            rewritten = loaded.iter().filter(|u| u.rewritten).count(),
            "sandbox loaded units"
        );
        Ok(loaded)
    }

    pub fn unit(&self, type_name: &str) -> Option<Arc<CompiledUnit>> {
        self.units.read().get(type_name).cloned()
    }

    /// Find a method on `type_name` or its nearest supertype declaring it.
    pub fn find_method(
        &self,
        type_name: &str,
        name: &str,
        descriptor: &str,
    ) -> Option<(Arc<CompiledUnit>, usize)> {
        let mut next = Some(type_name.to_string());
        let mut hops = 0;
        while let Some(current) = next {
            let unit = self.unit(&current)?;
            if let Some(idx) = unit
                .methods
                .iter()
                .position(|m| m.name == name && m.descriptor == descriptor)
            {
                return Some((unit, idx));
            }
            hops += 1;
            if hops > self.config.max_call_depth {
                return None;
            }
            next = unit.super_name.clone();
        }
        None
    }

    pub(crate) fn object(&self, id: ObjectId) -> Result<Arc<HeapObject>, ExecutionError> {
        self.heap.object(id).ok_or_else(|| ExecutionError::NullReference {
            context: format!("dangling reference {}", id),
        })
    }

    pub(crate) fn object_type(&self, id: ObjectId) -> Result<String, ExecutionError> {
        Ok(self.object(id)?.type_name.clone())
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Create a sandbox thread. `None` models a thread without a name.
    pub fn new_thread(&self, name: Option<&str>) -> ExecThread {
        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        ExecThread::new(id, name.map(str::to_string))
    }

    pub fn invoke_static(
        &self,
        thread: &mut ExecThread,
        owner: &str,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, ExecutionError> {
        self.invoke_static_ref(thread, &MethodRef::new(owner, name, descriptor), args)
    }

    pub fn invoke_virtual(
        &self,
        thread: &mut ExecThread,
        receiver: Value,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, ExecutionError> {
        let id = receiver.as_object(name)?;
        let owner = self.object_type(id)?;
        self.invoke_virtual_ref(thread, &MethodRef::new(owner, name, descriptor), receiver, args)
    }

    /// `new T` followed by the constructor with `descriptor`.
    pub fn instantiate(
        &self,
        thread: &mut ExecThread,
        type_name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Value, ExecutionError> {
        let id = self.allocate(thread, type_name)?;
        let target = MethodRef::new(type_name, CONSTRUCTOR_NAME, descriptor);
        self.invoke_special_ref(thread, &target, Value::Ref(id), args)?;
        Ok(Value::Ref(id))
    }

    /// Read a field without going through the ledger.
    pub fn peek_field(&self, object: &Value, owner: &str, field: &str) -> Result<Value, ExecutionError> {
        let id = object.as_object(field)?;
        let declaring = self.declaring_type(&FieldRef::new(owner, field, ""))?;
        Ok(self
            .object(id)?
            .get(&declaring, field)
            .unwrap_or(Value::Null))
    }

    /// Read a static field without going through the ledger.
    pub fn peek_static(&self, owner: &str, field: &str) -> Option<Value> {
        self.heap.get_static(owner, field)
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("units", &self.units.read().len())
            .field("objects", &self.heap.object_count())
            .field("policy", &self.ledger.policy())
            .field("config", &self.config)
            .finish()
    }
}
