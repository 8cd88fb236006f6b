//! # Type Resolution
//!
//! The lookup path the exclusion resolver consults when a decision depends on
//! a type other than the one being rewritten (supertypes carrying `Excluded`,
//! the declaring type of an inherited field).
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TypeLookup`] | Trait for resolving a type name to its compiled unit |
//! | [`LocalUnitResolver`] | Concurrent in-memory lookup path, fillable from directories |

use affinity_audit_types::encoding::read_unit_file;
use affinity_audit_types::{decode_unit_auto, CompiledUnit, DecodeError};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Extensions recognized as compiled units when scanning a directory.
pub const UNIT_EXTENSIONS: &[&str] = &["json", "unit", "bcs"];

// =============================================================================
// TypeLookup Trait
// =============================================================================

/// Resolve type names to compiled units. Never triggers loading.
pub trait TypeLookup: Send + Sync {
    fn lookup(&self, type_name: &str) -> Option<Arc<CompiledUnit>>;
}

impl<T: TypeLookup + ?Sized> TypeLookup for Arc<T> {
    fn lookup(&self, type_name: &str) -> Option<Arc<CompiledUnit>> {
        (**self).lookup(type_name)
    }
}

// =============================================================================
// LocalUnitResolver
// =============================================================================

/// In-memory lookup path shared by every loading thread.
#[derive(Debug, Default)]
pub struct LocalUnitResolver {
    units: RwLock<HashMap<String, Arc<CompiledUnit>>>,
}

impl LocalUnitResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit, replacing any earlier unit of the same name.
    pub fn register(&self, unit: CompiledUnit) -> Arc<CompiledUnit> {
        let unit = Arc::new(unit);
        self.register_shared(unit.clone());
        unit
    }

    pub fn register_shared(&self, unit: Arc<CompiledUnit>) {
        let previous = self.units.write().insert(unit.name.clone(), unit.clone());
        if previous.is_some() {
            debug!(type_name = %unit.name, "replaced unit on lookup path");
        }
    }

    /// Decode (JSON or BCS) and register.
    pub fn register_raw(&self, bytes: &[u8]) -> Result<Arc<CompiledUnit>, DecodeError> {
        Ok(self.register(decode_unit_auto(bytes)?))
    }

    /// Register every unit file in `dir` (non-recursive). Unreadable files are
    /// skipped with a warning. Returns the number of units registered.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read lookup directory {}", dir.display()))?;
        let mut count = 0;
        for entry in entries {
            let path = entry?.path();
            let is_unit = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| UNIT_EXTENSIONS.iter().any(|u| ext.eq_ignore_ascii_case(u)));
            if !path.is_file() || !is_unit {
                continue;
            }
            match read_unit_file(&path) {
                Ok(unit) => {
                    self.register(unit);
                    count += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable unit");
                }
            }
        }
        debug!(dir = %dir.display(), count, "loaded lookup directory");
        Ok(count)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.units.read().contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl TypeLookup for LocalUnitResolver {
    fn lookup(&self, type_name: &str) -> Option<Arc<CompiledUnit>> {
        self.units.read().get(type_name).cloned()
    }
}
