//! Object and static storage, plus type-initialization bookkeeping.
//!
//! Field storage is keyed by (declaring type, field name), matching the
//! ledger's notion of field identity.

use super::value::{ObjectId, Value};
use crate::errors::ExecutionError;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Slot = (String, String);

/// One heap-allocated instance.
#[derive(Debug)]
pub struct HeapObject {
    pub id: ObjectId,
    pub type_name: String,
    fields: Mutex<HashMap<Slot, Value>>,
}

impl HeapObject {
    /// Stored value, or `None` if the field was never written.
    pub fn get(&self, owner: &str, field: &str) -> Option<Value> {
        self.fields
            .lock()
            .get(&(owner.to_string(), field.to_string()))
            .cloned()
    }

    pub fn set(&self, owner: &str, field: &str, value: Value) {
        self.fields
            .lock()
            .insert((owner.to_string(), field.to_string()), value);
    }
}

/// Shared heap of one sandbox.
#[derive(Debug)]
pub struct Heap {
    next_id: AtomicU64,
    objects: RwLock<HashMap<ObjectId, Arc<HeapObject>>>,
    statics: RwLock<HashMap<Slot, Value>>,
}

impl Default for Heap {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            objects: RwLock::new(HashMap::new()),
            statics: RwLock::new(HashMap::new()),
        }
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, type_name: &str) -> Arc<HeapObject> {
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let object = Arc::new(HeapObject {
            id,
            type_name: type_name.to_string(),
            fields: Mutex::new(HashMap::new()),
        });
        self.objects.write().insert(id, object.clone());
        object
    }

    pub fn object(&self, id: ObjectId) -> Option<Arc<HeapObject>> {
        self.objects.read().get(&id).cloned()
    }

    pub fn get_static(&self, owner: &str, field: &str) -> Option<Value> {
        self.statics
            .read()
            .get(&(owner.to_string(), field.to_string()))
            .cloned()
    }

    pub fn set_static(&self, owner: &str, field: &str, value: Value) {
        self.statics
            .write()
            .insert((owner.to_string(), field.to_string()), value);
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }
}

// =============================================================================
// Type Initialization
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum InitState {
    /// `<clinit>` is running on the given sandbox thread.
    InProgress(u64),
    Done,
    Failed(String),
}

/// What the caller of [`InitTable::begin`] must do next.
#[derive(Debug, PartialEq, Eq)]
pub enum InitTicket {
    /// The caller owns initialization and must call [`InitTable::finish`].
    Run,
    /// Already initialized, or being initialized by this same thread.
    Ready,
}

/// Per-type initialization states. Concurrent triggers block until the
/// initializing thread finishes.
#[derive(Debug, Default)]
pub struct InitTable {
    states: Mutex<HashMap<String, InitState>>,
    changed: Condvar,
}

impl InitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, type_name: &str, thread: u64) -> Result<InitTicket, ExecutionError> {
        let mut states = self.states.lock();
        loop {
            match states.get(type_name) {
                None => {
                    states.insert(type_name.to_string(), InitState::InProgress(thread));
                    return Ok(InitTicket::Run);
                }
                Some(InitState::Done) => return Ok(InitTicket::Ready),
                Some(InitState::InProgress(owner)) if *owner == thread => {
                    return Ok(InitTicket::Ready)
                }
                Some(InitState::InProgress(_)) => self.changed.wait(&mut states),
                Some(InitState::Failed(message)) => {
                    return Err(ExecutionError::InitializationFailed {
                        type_name: type_name.to_string(),
                        message: message.clone(),
                    })
                }
            }
        }
    }

    pub fn finish(&self, type_name: &str, result: Result<(), String>) {
        let state = match result {
            Ok(()) => InitState::Done,
            Err(message) => InitState::Failed(message),
        };
        self.states.lock().insert(type_name.to_string(), state);
        self.changed.notify_all();
    }

    pub fn is_initialized(&self, type_name: &str) -> bool {
        matches!(self.states.lock().get(type_name), Some(InitState::Done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_object_fields_are_per_instance() {
        let heap = Heap::new();
        let a = heap.allocate("com/model/Model");
        let b = heap.allocate("com/model/Model");
        assert_ne!(a.id, b.id);
        a.set("com/model/Model", "value", Value::Int(1));
        assert_eq!(a.get("com/model/Model", "value"), Some(Value::Int(1)));
        assert_eq!(b.get("com/model/Model", "value"), None);
        assert_eq!(heap.object(a.id).unwrap().type_name, "com/model/Model");
    }

    #[test]
    fn test_reentrant_initialization() {
        let table = InitTable::new();
        assert_eq!(table.begin("com/model/A", 1).unwrap(), InitTicket::Run);
        assert_eq!(table.begin("com/model/A", 1).unwrap(), InitTicket::Ready);
        table.finish("com/model/A", Ok(()));
        assert!(table.is_initialized("com/model/A"));
        assert_eq!(table.begin("com/model/A", 2).unwrap(), InitTicket::Ready);
    }

    #[test]
    fn test_failed_initialization_sticks() {
        let table = InitTable::new();
        table.begin("com/model/A", 1).unwrap();
        table.finish("com/model/A", Err("boom".into()));
        assert!(matches!(
            table.begin("com/model/A", 2),
            Err(ExecutionError::InitializationFailed { .. })
        ));
    }

    #[test]
    fn test_concurrent_trigger_waits() {
        let table = Arc::new(InitTable::new());
        assert_eq!(table.begin("com/model/A", 1).unwrap(), InitTicket::Run);
        let waiter = {
            let table = table.clone();
            std::thread::spawn(move || table.begin("com/model/A", 2).unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        table.finish("com/model/A", Ok(()));
        assert_eq!(waiter.join().unwrap(), InitTicket::Ready);
    }
}
