//! # Native Functions
//!
//! Runtime entry points that instrumented and demo code call but that have no
//! managed body.
//!
//! | Owner | Name | Behavior |
//! |-------|------|----------|
//! | `affinity/runtime/AccessLedger` | `observe` | forwards the access to the ledger |
//! | `affinity/runtime/Threads` | `currentName` | name of the executing thread, or null |
//! | `affinity/runtime/Debug` | `log` | logs a value at debug level |
//! | `java/lang/Object` | `<init>` | no-op root constructor |

use super::thread::ExecThread;
use super::value::Value;
use crate::errors::ExecutionError;
use crate::ledger::{AccessLedger, FieldAccess, SiteContext};
use crate::rewrite::{LEDGER_OWNER, OBSERVE_NAME};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const THREADS_OWNER: &str = "affinity/runtime/Threads";
pub const DEBUG_OWNER: &str = "affinity/runtime/Debug";
/// Root of every type hierarchy; its constructor is native.
pub const ROOT_TYPE: &str = "java/lang/Object";

/// What a native sees of its caller.
pub struct NativeContext<'a> {
    pub thread: &'a ExecThread,
}

pub type NativeResult = Result<Option<Value>, ExecutionError>;

pub type NativeFunction = Arc<dyn Fn(&NativeContext<'_>, Vec<Value>) -> NativeResult + Send + Sync>;

/// Natives keyed by (owner, name).
#[derive(Clone, Default)]
pub struct NativeFunctionTable {
    functions: HashMap<(String, String), NativeFunction>,
}

impl NativeFunctionTable {
    pub fn insert(&mut self, owner: &str, name: &str, function: NativeFunction) {
        self.functions
            .insert((owner.to_string(), name.to_string()), function);
    }

    pub fn get(&self, owner: &str, name: &str) -> Option<&NativeFunction> {
        self.functions.get(&(owner.to_string(), name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for NativeFunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self
            .functions
            .keys()
            .map(|(owner, name)| format!("{}.{}", owner, name))
            .collect();
        names.sort();
        f.debug_struct("NativeFunctionTable")
            .field("functions", &names)
            .finish()
    }
}

/// Build the native table bound to `ledger`.
pub fn build_native_function_table(ledger: Arc<dyn AccessLedger>) -> NativeFunctionTable {
    let mut table = NativeFunctionTable::default();

    table.insert(
        LEDGER_OWNER,
        OBSERVE_NAME,
        make_native(move |ctx, args| observe(ledger.as_ref(), ctx, &args)),
    );

    table.insert(
        THREADS_OWNER,
        "currentName",
        make_native(|ctx, _args| {
            Ok(Some(match ctx.thread.name() {
                Some(name) => Value::str(name),
                None => Value::Null,
            }))
        }),
    );

    table.insert(
        DEBUG_OWNER,
        "log",
        make_native(|ctx, args| {
            for value in &args {
                debug!(thread = ctx.thread.display_name(), value = %value, "sandbox log");
            }
            Ok(None)
        }),
    );

    table.insert(ROOT_TYPE, "<init>", make_native(|_ctx, _args| Ok(None)));

    table
}

/// `observe(thread, receiver, owner, field, isStatic, isRead, context)`.
fn observe(ledger: &dyn AccessLedger, ctx: &NativeContext<'_>, args: &[Value]) -> NativeResult {
    const SITE: &str = "AccessLedger.observe";
    let [thread, receiver, owner, field, is_static, is_read, context] = args else {
        return Err(ExecutionError::TypeMismatch {
            expected: "7 arguments",
            got: format!("{} arguments", args.len()),
            context: SITE.to_string(),
        });
    };
    // The ledger classifies the thread named by the handle, which must be the
    // one executing the access.
    match thread {
        Value::Thread(id) if *id == ctx.thread.id() => {}
        other => {
            return Err(ExecutionError::TypeMismatch {
                expected: "handle of the executing thread",
                got: match other {
                    Value::Thread(id) => format!("handle of thread {}", id),
                    value => value.type_label().to_string(),
                },
                context: SITE.to_string(),
            })
        }
    }
    let owner = owner.as_str(SITE)?;
    let field = field.as_str(SITE)?;
    let is_static = is_static.as_bool(SITE)?;
    let is_read = is_read.as_bool(SITE)?;
    let context = SiteContext::from_int(context.as_int(SITE)?);

    let access = if is_static {
        if is_read {
            FieldAccess::static_read(owner, field)
        } else {
            FieldAccess::static_write(owner, field)
        }
    } else {
        let receiver = match receiver {
            // The access itself raises the null reference.
            Value::Null => return Ok(None),
            other => other.as_object(SITE)?.receiver(),
        };
        if is_read {
            FieldAccess::instance_read(owner, field, receiver)
        } else {
            FieldAccess::instance_write(owner, field, receiver)
        }
    };

    ledger
        .observe(ctx.thread, &access.with_context(context))
        .map_err(ExecutionError::Violation)?;
    Ok(None)
}

/// Helper to create a NativeFunction from a closure
fn make_native<F>(f: F) -> NativeFunction
where
    F: Fn(&NativeContext<'_>, Vec<Value>) -> NativeResult + Send + Sync + 'static,
{
    Arc::new(f)
}
