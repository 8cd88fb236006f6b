//! Sharded per-key state cells.

use super::WriteRecord;
use affinity_audit_types::{Category, FieldKey, ReceiverId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const NUM_SHARDS: usize = 16;

type ReceiverCells = HashMap<Option<ReceiverId>, Arc<KeyCell>>;
type FieldCells = HashMap<Arc<str>, ReceiverCells>;
type OwnerCells = HashMap<Arc<str>, FieldCells>;

/// Strict-alternation pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pin {
    pub category: Category,
    pub thread: String,
}

#[derive(Debug, Default)]
pub(crate) struct CellState {
    pub record: Option<WriteRecord>,
    pub pin: Option<Pin>,
}

/// State of one field storage slot.
///
/// `flagged` is only ever set through [`KeyCell::try_flag`], so exactly one
/// caller wins the right to report the key.
#[derive(Debug)]
pub(crate) struct KeyCell {
    key: FieldKey,
    flagged: AtomicBool,
    state: Mutex<CellState>,
}

impl KeyCell {
    fn new(key: FieldKey) -> Self {
        Self {
            key,
            flagged: AtomicBool::new(false),
            state: Mutex::new(CellState::default()),
        }
    }

    pub fn key(&self) -> &FieldKey {
        &self.key
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::Acquire)
    }

    /// Returns `true` for the single caller that flips the flag.
    pub fn try_flag(&self) -> bool {
        self.flagged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn state(&self) -> MutexGuard<'_, CellState> {
        self.state.lock()
    }
}

/// Arena of key cells, split into shards by key hash.
pub(crate) struct CellArena {
    shards: Box<[RwLock<OwnerCells>]>,
    hasher: RandomState,
}

impl CellArena {
    pub fn new() -> Self {
        let shards: Vec<RwLock<OwnerCells>> =
            (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
            hasher: RandomState::new(),
        }
    }

    fn shard_for(&self, owner: &str, field: &str, receiver: Option<ReceiverId>) -> usize {
        (self.hasher.hash_one((owner, field, receiver)) as usize) % NUM_SHARDS
    }

    /// Existing cell, without allocating.
    pub fn get(&self, owner: &str, field: &str, receiver: Option<ReceiverId>) -> Option<Arc<KeyCell>> {
        let shard = self.shards[self.shard_for(owner, field, receiver)].read();
        shard.get(owner)?.get(field)?.get(&receiver).cloned()
    }

    /// Existing cell, or a fresh one for `key`.
    pub fn get_or_insert(&self, key: &FieldKey) -> Arc<KeyCell> {
        let (owner, field) = match key {
            FieldKey::Instance { owner, field, .. } | FieldKey::Static { owner, field } => {
                (owner, field)
            }
        };
        let receiver = key.receiver();
        if let Some(cell) = self.get(owner, field, receiver) {
            return cell;
        }
        let mut shard = self.shards[self.shard_for(owner, field, receiver)].write();
        shard
            .entry(owner.clone())
            .or_default()
            .entry(field.clone())
            .or_default()
            .entry(receiver)
            .or_insert_with(|| Arc::new(KeyCell::new(key.clone())))
            .clone()
    }

    /// All live cells, in no particular order.
    pub fn cells(&self) -> Vec<Arc<KeyCell>> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read();
            for fields in shard.values() {
                for receivers in fields.values() {
                    out.extend(receivers.values().cloned());
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .values()
                    .flat_map(|fields| fields.values())
                    .map(HashMap::len)
                    .sum::<usize>()
            })
            .sum()
    }

    /// Drop every cell. Callers still holding a cell keep a detached copy.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_does_not_create() {
        let arena = CellArena::new();
        assert!(arena.get("a/B", "x", Some(ReceiverId(1))).is_none());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_get_or_insert_is_idempotent() {
        let arena = CellArena::new();
        let key = FieldKey::instance("a/B", "x", ReceiverId(1));
        let first = arena.get_or_insert(&key);
        let second = arena.get_or_insert(&key);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(
            &first,
            &arena.get("a/B", "x", Some(ReceiverId(1))).unwrap()
        ));

        arena.get_or_insert(&FieldKey::instance("a/B", "x", ReceiverId(2)));
        arena.get_or_insert(&FieldKey::of_static("a/B", "x"));
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.cells().len(), 3);
    }

    #[test]
    fn test_flag_fires_once() {
        let arena = CellArena::new();
        let cell = arena.get_or_insert(&FieldKey::of_static("a/B", "x"));
        assert!(!cell.is_flagged());
        assert!(cell.try_flag());
        assert!(!cell.try_flag());
        assert!(cell.is_flagged());
    }

    #[test]
    fn test_clear_detaches_cells() {
        let arena = CellArena::new();
        let key = FieldKey::of_static("a/B", "x");
        let old = arena.get_or_insert(&key);
        old.try_flag();
        arena.clear();
        assert_eq!(arena.len(), 0);
        let fresh = arena.get_or_insert(&key);
        assert!(!fresh.is_flagged());
        assert!(!Arc::ptr_eq(&old, &fresh));
    }
}
