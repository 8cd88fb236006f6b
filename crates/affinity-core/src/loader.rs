//! # Loader Hook
//!
//! The bridge between the loading collaborator and the rewrite engine. The
//! collaborator hands over `(type name, raw bytes)` and gets back either the
//! rewritten bytes or an instruction to keep the original.
//!
//! The hook never initiates loading: supertypes and field owners are resolved
//! only from units already registered on the lookup path. Every unit that
//! decodes is registered, whether or not it gets rewritten.

use crate::config::{AuditConfig, TargetScope};
use crate::errors::RewriteError;
use crate::metrics::{LoaderMetrics, LoaderMetricsSnapshot};
use crate::resolver::LocalUnitResolver;
use crate::rewrite::{RewriteEngine, RewriteOutcome, UnchangedReason};
use affinity_audit_types::unit::RUNTIME_NAMESPACE;
use affinity_audit_types::{decode_unit, encode_unit, CompiledUnit};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Result handed back to the loading collaborator.
#[derive(Debug, Clone)]
pub enum TransformOutcome {
    /// Keep the original bytes.
    Unchanged(UnchangedReason),
    /// Use these bytes instead.
    Rewritten(Vec<u8>),
}

impl TransformOutcome {
    pub fn is_rewritten(&self) -> bool {
        matches!(self, TransformOutcome::Rewritten(_))
    }

    /// The bytes to define: the rewritten ones, or `original`.
    pub fn bytes_or<'a>(&'a self, original: &'a [u8]) -> &'a [u8] {
        match self {
            TransformOutcome::Rewritten(bytes) => bytes,
            TransformOutcome::Unchanged(_) => original,
        }
    }
}

/// Load-time rewrite hook.
pub struct LoaderHook {
    scope: TargetScope,
    engine: RewriteEngine,
    lookup: Arc<LocalUnitResolver>,
    metrics: LoaderMetrics,
}

impl LoaderHook {
    pub fn new(config: &AuditConfig, lookup: Arc<LocalUnitResolver>) -> Self {
        let scope = config.scope();
        info!(targets = ?scope.prefixes(), "loader hook installed");
        Self {
            engine: RewriteEngine::new(lookup.clone(), scope.clone()),
            scope,
            lookup,
            metrics: LoaderMetrics::default(),
        }
    }

    pub fn engine(&self) -> &RewriteEngine {
        &self.engine
    }

    pub fn lookup(&self) -> &Arc<LocalUnitResolver> {
        &self.lookup
    }

    pub fn metrics(&self) -> LoaderMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Transform one raw unit.
    pub fn transform(&self, type_name: &str, raw: &[u8]) -> TransformOutcome {
        match self.admit(type_name, raw) {
            Ok(unit) => self.transform_unit(unit),
            Err(outcome) => outcome,
        }
    }

    /// Scope filtering and decoding, ahead of any rewrite.
    fn admit(&self, type_name: &str, raw: &[u8]) -> Result<CompiledUnit, TransformOutcome> {
        self.metrics.record_seen();
        if type_name.starts_with(RUNTIME_NAMESPACE) {
            self.metrics.record_out_of_scope();
            return Err(TransformOutcome::Unchanged(UnchangedReason::RuntimeNamespace));
        }
        if !self.scope.contains(type_name) {
            self.metrics.record_out_of_scope();
            return Err(TransformOutcome::Unchanged(UnchangedReason::OutOfScope));
        }

        decode_unit(raw).map_err(|e| {
            debug!(type_name, error = %e, "undecodable unit, leaving unchanged");
            self.metrics.record_invalid_input();
            TransformOutcome::Unchanged(UnchangedReason::InvalidInput(RewriteError::Decode(e)))
        })
    }

    /// Transform an already decoded unit.
    pub fn transform_unit(&self, unit: CompiledUnit) -> TransformOutcome {
        let unit = self.lookup.register(unit);
        self.rewrite_registered(&unit)
    }

    /// Transform many units across the rayon pool. Results keep input order.
    ///
    /// Every decodable unit is registered before any is rewritten, so a
    /// subtype resolves a supertype that comes later in the batch.
    pub fn transform_batch(&self, units: &[(String, Vec<u8>)]) -> Vec<TransformOutcome> {
        let admitted: Vec<Result<CompiledUnit, TransformOutcome>> = units
            .par_iter()
            .map(|(name, raw)| self.admit(name, raw))
            .collect();
        let registered: Vec<Result<Arc<CompiledUnit>, TransformOutcome>> = admitted
            .into_iter()
            .map(|admitted| admitted.map(|unit| self.lookup.register(unit)))
            .collect();
        registered
            .into_par_iter()
            .map(|registered| match registered {
                Ok(unit) => self.rewrite_registered(&unit),
                Err(outcome) => outcome,
            })
            .collect()
    }

    fn rewrite_registered(&self, unit: &CompiledUnit) -> TransformOutcome {
        match self.engine.rewrite(unit) {
            RewriteOutcome::Rewritten { unit: rewritten, stats } => match encode_unit(&rewritten) {
                Ok(bytes) => {
                    self.metrics.record_rewritten(stats.sites_instrumented);
                    TransformOutcome::Rewritten(bytes)
                }
                Err(e) => {
                    error!(type_name = %unit.name, error = %e, "failed to encode rewritten unit");
                    self.metrics.record_rewrite_failure();
                    TransformOutcome::Unchanged(UnchangedReason::RewriteFailure(
                        RewriteError::Encode {
                            type_name: unit.name.clone(),
                            message: e.to_string(),
                        },
                    ))
                }
            },
            RewriteOutcome::Unchanged(reason) => {
                self.record_unchanged(&reason);
                TransformOutcome::Unchanged(reason)
            }
        }
    }

    fn record_unchanged(&self, reason: &UnchangedReason) {
        match reason {
            UnchangedReason::OutOfScope | UnchangedReason::RuntimeNamespace => {
                self.metrics.record_out_of_scope()
            }
            UnchangedReason::ClassExcluded
            | UnchangedReason::NothingToInstrument
            | UnchangedReason::AlreadyInstrumented => self.metrics.record_untouched(),
            UnchangedReason::InvalidInput(_) => self.metrics.record_invalid_input(),
            UnchangedReason::ResolutionFailure(_) => self.metrics.record_resolution_failure(),
            UnchangedReason::RewriteFailure(_) => self.metrics.record_rewrite_failure(),
        }
    }
}

impl std::fmt::Debug for LoaderHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderHook")
            .field("scope", &self.scope)
            .field("registered", &self.lookup.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use affinity_audit_types::builder::{MethodBuilder, UnitBuilder};
    use affinity_audit_types::{FieldRef, Instruction};

    fn hook() -> LoaderHook {
        LoaderHook::new(&AuditConfig::default(), Arc::new(LocalUnitResolver::new()))
    }

    fn counter_unit(name: &str) -> CompiledUnit {
        UnitBuilder::new(name)
            .static_field("count", "I")
            .method(
                MethodBuilder::new_static("bump", "()V")
                    .max_stack(2)
                    .op(Instruction::GetStatic(FieldRef::new(name, "count", "I")))
                    .op(Instruction::PushInt(1))
                    .op(Instruction::Add)
                    .op(Instruction::PutStatic(FieldRef::new(name, "count", "I")))
                    .op(Instruction::Return),
            )
            .build()
    }

    #[test]
    fn test_rewrites_in_scope_units() {
        let hook = hook();
        let raw = encode_unit(&counter_unit("com/model/Counter")).unwrap();
        let outcome = hook.transform("com/model/Counter", &raw);
        let TransformOutcome::Rewritten(bytes) = outcome else {
            panic!("expected rewrite");
        };
        let unit = decode_unit(&bytes).unwrap();
        assert!(unit.instruction_count() > 5);
        assert!(hook.lookup().contains("com/model/Counter"));
        let metrics = hook.metrics();
        assert_eq!(metrics.units_rewritten, 1);
        assert_eq!(metrics.sites_instrumented, 2);
    }

    #[test]
    fn test_filters_without_decoding() {
        let hook = hook();
        let garbage = [0xffu8, 0xff];
        assert!(matches!(
            hook.transform("affinity/runtime/AccessLedger", &garbage),
            TransformOutcome::Unchanged(UnchangedReason::RuntimeNamespace)
        ));
        assert!(matches!(
            hook.transform("org/lib/Thing", &garbage),
            TransformOutcome::Unchanged(UnchangedReason::OutOfScope)
        ));
        assert!(matches!(
            hook.transform("com/model/Broken", &garbage),
            TransformOutcome::Unchanged(UnchangedReason::InvalidInput(_))
        ));
        let metrics = hook.metrics();
        assert_eq!(metrics.units_seen, 3);
        assert_eq!(metrics.units_out_of_scope, 2);
        assert_eq!(metrics.invalid_inputs, 1);
    }

    #[test]
    fn test_batch_preserves_order() {
        let hook = hook();
        let units: Vec<(String, Vec<u8>)> = (0..8)
            .map(|i| {
                let name = format!("com/model/Counter{}", i);
                let raw = encode_unit(&counter_unit(&name)).unwrap();
                (name, raw)
            })
            .chain(std::iter::once(("org/lib/X".to_string(), vec![])))
            .collect();
        let outcomes = hook.transform_batch(&units);
        assert_eq!(outcomes.len(), 9);
        assert!(outcomes[..8].iter().all(TransformOutcome::is_rewritten));
        assert!(!outcomes[8].is_rewritten());
        assert_eq!(hook.lookup().len(), 8);
    }

    #[test]
    fn test_unchanged_keeps_original_bytes() {
        let outcome = TransformOutcome::Unchanged(UnchangedReason::OutOfScope);
        assert_eq!(outcome.bytes_or(b"raw"), b"raw");
    }
}
