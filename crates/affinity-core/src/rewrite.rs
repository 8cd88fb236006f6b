//! # Rewrite Engine
//!
//! Inserts a ledger check immediately before every qualifying field access of
//! a unit. The original access is always kept.
//!
//! ## Pipeline
//!
//! ```text
//! CompiledUnit ──verify──► plan (resolve owners, profiles, contexts)
//!                              │  InstrumentationPlan (immutable)
//!                              ▼
//!                          emit (read-only against the plan)
//!                              │  remap jumps, grow max_stack
//!                              ▼
//!                          verify emitted ──► Rewritten | Unchanged(reason)
//! ```
//!
//! ## Check sequences
//!
//! | Access | Prefix before the original instruction |
//! |--------|-----------------------------------------|
//! | `GetField` | `Dup, CurrentThread, Swap` |
//! | `PutField` | `Dup2, Pop, CurrentThread, Swap` |
//! | `GetStatic` / `PutStatic` | `CurrentThread, PushNull` |
//!
//! followed by `PushStr owner, PushStr field, PushBool static, PushBool read,
//! PushInt context, InvokeStatic affinity/runtime/AccessLedger.observe`. The
//! owner pushed is the declaring type of the field, so inherited fields share
//! one key per receiver.

use crate::config::TargetScope;
use crate::errors::RewriteError;
use crate::exclusion::{ExclusionProfile, ExclusionResolver, FieldResolution};
use crate::ledger::SiteContext;
use crate::resolver::TypeLookup;
use crate::verify::{verify_method, verify_unit};
use affinity_audit_types::unit::RUNTIME_NAMESPACE;
use affinity_audit_types::{
    CompiledUnit, FieldAccessKind, FieldRef, Instruction, MethodDef, MethodRef,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Runtime type hosting the ledger entry point.
pub const LEDGER_OWNER: &str = "affinity/runtime/AccessLedger";

pub const OBSERVE_NAME: &str = "observe";

/// `observe(thread, receiver, owner, field, isStatic, isRead, context)`.
pub const OBSERVE_DESCRIPTOR: &str =
    "(Laffinity/runtime/Thread;Ljava/lang/Object;Ljava/lang/String;Ljava/lang/String;ZZI)V";

/// Extra operand stack a check sequence needs above the access's own operands.
pub const INSTRUMENTATION_HEADROOM: u16 = 7;

// =============================================================================
// Plan
// =============================================================================

/// Why an access site was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// The declaring type is outside the instrumentation scope.
    OutOfScope,
    /// Inside `<init>`/`<clinit>` and the field does not opt in.
    InitRoutine,
    FieldExcluded,
    MethodExcluded,
    /// A ledger check already sits directly in front of the access.
    AlreadyGuarded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::OutOfScope => "out of scope",
            SkipReason::InitRoutine => "initialization routine",
            SkipReason::FieldExcluded => "field excluded",
            SkipReason::MethodExcluded => "method excluded",
            SkipReason::AlreadyGuarded => "already guarded",
        };
        f.write_str(s)
    }
}

/// One access that will receive a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedSite {
    /// Index into `CompiledUnit::methods`.
    pub method: usize,
    pub pc: usize,
    /// Declaring type of the field.
    pub owner: String,
    pub field: String,
    pub kind: FieldAccessKind,
    pub context: SiteContext,
}

/// One access left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSite {
    pub method: usize,
    pub pc: usize,
    pub field: String,
    pub reason: SkipReason,
}

/// Immutable result of the planning phase.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentationPlan {
    pub type_name: String,
    pub profile: Arc<ExclusionProfile>,
    /// Sorted by (method, pc).
    pub sites: Vec<PlannedSite>,
    pub skipped: Vec<SkippedSite>,
}

impl InstrumentationPlan {
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    fn sites_in(&self, method: usize) -> impl Iterator<Item = &PlannedSite> {
        self.sites.iter().filter(move |s| s.method == method)
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RewriteStats {
    pub sites_instrumented: usize,
    pub sites_skipped: usize,
    pub methods_touched: usize,
}

/// Why a unit came back unchanged.
#[derive(Debug, Clone)]
pub enum UnchangedReason {
    OutOfScope,
    RuntimeNamespace,
    ClassExcluded,
    NothingToInstrument,
    /// Every qualifying access already carries a ledger check.
    AlreadyInstrumented,
    /// The input did not decode or verify.
    InvalidInput(RewriteError),
    ResolutionFailure(RewriteError),
    RewriteFailure(RewriteError),
}

impl UnchangedReason {
    /// Short machine-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            UnchangedReason::OutOfScope => "out_of_scope",
            UnchangedReason::RuntimeNamespace => "runtime_namespace",
            UnchangedReason::ClassExcluded => "class_excluded",
            UnchangedReason::NothingToInstrument => "nothing_to_instrument",
            UnchangedReason::AlreadyInstrumented => "already_instrumented",
            UnchangedReason::InvalidInput(_) => "invalid_input",
            UnchangedReason::ResolutionFailure(_) => "resolution_failure",
            UnchangedReason::RewriteFailure(_) => "rewrite_failure",
        }
    }

    pub fn error(&self) -> Option<&RewriteError> {
        match self {
            UnchangedReason::InvalidInput(e)
            | UnchangedReason::ResolutionFailure(e)
            | UnchangedReason::RewriteFailure(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for UnchangedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnchangedReason::OutOfScope => write!(f, "outside the instrumentation scope"),
            UnchangedReason::RuntimeNamespace => write!(f, "part of the auditing runtime"),
            UnchangedReason::ClassExcluded => write!(f, "class excluded"),
            UnchangedReason::NothingToInstrument => write!(f, "no qualifying field accesses"),
            UnchangedReason::AlreadyInstrumented => write!(f, "already instrumented"),
            UnchangedReason::InvalidInput(e) => write!(f, "invalid input: {}", e),
            UnchangedReason::ResolutionFailure(e) => write!(f, "resolution failure: {}", e),
            UnchangedReason::RewriteFailure(e) => write!(f, "rewrite failure: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RewriteOutcome {
    Rewritten {
        unit: CompiledUnit,
        stats: RewriteStats,
    },
    Unchanged(UnchangedReason),
}

impl RewriteOutcome {
    pub fn is_rewritten(&self) -> bool {
        matches!(self, RewriteOutcome::Rewritten { .. })
    }

    pub fn rewritten(&self) -> Option<&CompiledUnit> {
        match self {
            RewriteOutcome::Rewritten { unit, .. } => Some(unit),
            RewriteOutcome::Unchanged(_) => None,
        }
    }

    pub fn unchanged_reason(&self) -> Option<&UnchangedReason> {
        match self {
            RewriteOutcome::Unchanged(reason) => Some(reason),
            RewriteOutcome::Rewritten { .. } => None,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Plans and emits ledger checks for compiled units.
#[derive(Debug)]
pub struct RewriteEngine {
    resolver: ExclusionResolver,
}

impl RewriteEngine {
    pub fn new(lookup: Arc<dyn TypeLookup>, scope: TargetScope) -> Self {
        Self {
            resolver: ExclusionResolver::new(lookup, scope),
        }
    }

    pub fn with_resolver(resolver: ExclusionResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &ExclusionResolver {
        &self.resolver
    }

    /// Rewrite one unit. Never fails: every problem yields `Unchanged`.
    pub fn rewrite(&self, unit: &CompiledUnit) -> RewriteOutcome {
        if unit.name.starts_with(RUNTIME_NAMESPACE) {
            return RewriteOutcome::Unchanged(UnchangedReason::RuntimeNamespace);
        }
        if !self.resolver.scope().contains(&unit.name) {
            return RewriteOutcome::Unchanged(UnchangedReason::OutOfScope);
        }

        if let Some((verdict, e)) = verify_unit(unit).first_failure() {
            debug!(type_name = %unit.name, method = %verdict.signature(), error = %e,
                "input does not verify, leaving unchanged");
            return RewriteOutcome::Unchanged(UnchangedReason::InvalidInput(
                RewriteError::UnverifiableInput {
                    type_name: unit.name.clone(),
                    method: verdict.signature(),
                    error: e.clone(),
                },
            ));
        }

        let plan = match self.plan(unit) {
            Ok(plan) => plan,
            Err(e) if e.is_resolution_failure() => {
                debug!(type_name = %unit.name, error = %e, "resolution failure, leaving unchanged");
                return RewriteOutcome::Unchanged(UnchangedReason::ResolutionFailure(e));
            }
            Err(e) => {
                error!(type_name = %unit.name, error = %e, "planning failed");
                return RewriteOutcome::Unchanged(UnchangedReason::RewriteFailure(e));
            }
        };
        if plan.profile.is_class_excluded() {
            return RewriteOutcome::Unchanged(UnchangedReason::ClassExcluded);
        }
        if plan.is_empty() {
            let reason = if plan.skipped.iter().any(|s| s.reason == SkipReason::AlreadyGuarded) {
                UnchangedReason::AlreadyInstrumented
            } else {
                UnchangedReason::NothingToInstrument
            };
            return RewriteOutcome::Unchanged(reason);
        }

        let (emitted, stats) = emit(unit, &plan);
        match check_emitted(unit, &emitted) {
            Ok(()) => {
                debug!(
                    type_name = %unit.name,
                    sites = stats.sites_instrumented,
                    skipped = stats.sites_skipped,
                    methods = stats.methods_touched,
                    "instrumented unit"
                );
                RewriteOutcome::Rewritten {
                    unit: emitted,
                    stats,
                }
            }
            Err(e) => {
                error!(type_name = %unit.name, error = %e, "rewritten unit failed verification");
                RewriteOutcome::Unchanged(UnchangedReason::RewriteFailure(e))
            }
        }
    }

    /// Phase 1: decide which access sites receive a check.
    pub fn plan(&self, unit: &CompiledUnit) -> Result<InstrumentationPlan, RewriteError> {
        let mut session = self.resolver.session(unit)?;
        let profile = session.current().clone();
        let mut sites = Vec::new();
        let mut skipped = Vec::new();
        if profile.is_class_excluded() {
            return Ok(InstrumentationPlan {
                type_name: unit.name.clone(),
                profile,
                sites,
                skipped,
            });
        }

        for (method_idx, method) in unit.methods.iter().enumerate() {
            let method_excluded = profile.is_method_excluded(&method.name, &method.descriptor);
            for (pc, instruction) in method.code.iter().enumerate() {
                let Some((field_ref, kind)) = instruction.field_access() else {
                    continue;
                };
                let mut skip = |reason| {
                    skipped.push(SkippedSite {
                        method: method_idx,
                        pc,
                        field: field_ref.name.clone(),
                        reason,
                    })
                };
                if pc > 0 && is_observe_call(&method.code[pc - 1]) {
                    skip(SkipReason::AlreadyGuarded);
                    continue;
                }
                if method_excluded {
                    skip(SkipReason::MethodExcluded);
                    continue;
                }
                let declaring = match session.resolve_field(&field_ref.owner, &field_ref.name)? {
                    FieldResolution::Declared(declaring) => declaring,
                    FieldResolution::OutOfScope => {
                        skip(SkipReason::OutOfScope);
                        continue;
                    }
                };
                if method.is_initializer() && !declaring.tracks_init_writes(&field_ref.name) {
                    skip(SkipReason::InitRoutine);
                    continue;
                }
                if declaring.is_field_excluded(&field_ref.name) {
                    skip(SkipReason::FieldExcluded);
                    continue;
                }
                let mut context = declaring.site_context(&field_ref.name);
                if method.is_initializer() {
                    context = context.with(SiteContext::DURING_INIT);
                }
                sites.push(PlannedSite {
                    method: method_idx,
                    pc,
                    owner: declaring.type_name.clone(),
                    field: field_ref.name.clone(),
                    kind,
                    context,
                });
            }
        }

        Ok(InstrumentationPlan {
            type_name: unit.name.clone(),
            profile,
            sites,
            skipped,
        })
    }
}

// =============================================================================
// Emission
// =============================================================================

/// Phase 2: produce the rewritten unit. Reads the plan only.
pub fn emit(unit: &CompiledUnit, plan: &InstrumentationPlan) -> (CompiledUnit, RewriteStats) {
    let mut rewritten = unit.clone();
    let mut stats = RewriteStats {
        sites_skipped: plan.skipped.len(),
        ..RewriteStats::default()
    };
    for (method_idx, method) in rewritten.methods.iter_mut().enumerate() {
        let sites: Vec<&PlannedSite> = plan.sites_in(method_idx).collect();
        if sites.is_empty() {
            continue;
        }
        emit_method(method, &sites);
        stats.sites_instrumented += sites.len();
        stats.methods_touched += 1;
    }
    (rewritten, stats)
}

fn emit_method(method: &mut MethodDef, sites: &[&PlannedSite]) {
    let original = std::mem::take(&mut method.code);
    let mut code = Vec::with_capacity(original.len() + sites.len() * 11);
    // Old pc -> new pc of the first instruction executed for it.
    let mut remap = Vec::with_capacity(original.len());
    let mut pending = sites.iter().peekable();

    for (pc, instruction) in original.iter().enumerate() {
        remap.push(code.len() as u32);
        if let Some(site) = pending.next_if(|s| s.pc == pc) {
            code.extend(check_sequence(site));
        }
        code.push(instruction.clone());
    }

    for instruction in code.iter_mut() {
        if let Some(target) = instruction.branch_target() {
            // Out-of-range targets cannot occur on verified input.
            if let Some(new_target) = remap.get(target as usize) {
                *instruction = instruction.with_branch_target(*new_target);
            }
        }
    }
    method.code = code;
    method.max_stack = method.max_stack.saturating_add(INSTRUMENTATION_HEADROOM);
}

/// The instructions inserted before one access.
fn check_sequence(site: &PlannedSite) -> Vec<Instruction> {
    let mut seq = match site.kind {
        FieldAccessKind::InstanceRead => {
            vec![Instruction::Dup, Instruction::CurrentThread, Instruction::Swap]
        }
        FieldAccessKind::InstanceWrite => vec![
            Instruction::Dup2,
            Instruction::Pop,
            Instruction::CurrentThread,
            Instruction::Swap,
        ],
        FieldAccessKind::StaticRead | FieldAccessKind::StaticWrite => {
            vec![Instruction::CurrentThread, Instruction::PushNull]
        }
    };
    seq.extend([
        Instruction::PushStr(site.owner.clone()),
        Instruction::PushStr(site.field.clone()),
        Instruction::PushBool(site.kind.is_static()),
        Instruction::PushBool(site.kind.is_read()),
        Instruction::PushInt(i64::from(site.context.bits())),
        Instruction::InvokeStatic(observe_ref()),
    ]);
    seq
}

pub fn observe_ref() -> MethodRef {
    MethodRef::new(LEDGER_OWNER, OBSERVE_NAME, OBSERVE_DESCRIPTOR)
}

/// True if `instruction` is a call into the ledger entry point.
pub fn is_observe_call(instruction: &Instruction) -> bool {
    matches!(instruction, Instruction::InvokeStatic(m)
        if m.owner == LEDGER_OWNER && m.name == OBSERVE_NAME)
}

/// Verify every method of the emitted unit whose original counterpart verified.
pub(crate) fn check_emitted(
    original: &CompiledUnit,
    emitted: &CompiledUnit,
) -> Result<(), RewriteError> {
    for method in &emitted.methods {
        let original_ok = original
            .method(&method.name, &method.descriptor)
            .map(|m| verify_method(m).is_ok())
            .unwrap_or(true);
        if !original_ok {
            continue;
        }
        if let Err(e) = verify_method(method) {
            return Err(RewriteError::Verification {
                type_name: emitted.name.clone(),
                method: format!("{}{}", method.name, method.descriptor),
                error: e,
            });
        }
    }
    Ok(())
}

/// Field access the check at `pc` guards, when `pc` starts a check sequence.
pub fn guarded_access(code: &[Instruction], pc: usize) -> Option<&FieldRef> {
    code.get(pc..)?
        .iter()
        .position(is_observe_call)
        .and_then(|offset| code.get(pc + offset + 1))
        .and_then(|i| i.field_access())
        .map(|(r, _)| r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::LocalUnitResolver;
    use affinity_audit_types::builder::{MethodBuilder, UnitBuilder};
    use affinity_audit_types::markers;

    fn engine_with(units: Vec<CompiledUnit>) -> RewriteEngine {
        let lookup = Arc::new(LocalUnitResolver::new());
        for unit in units {
            lookup.register(unit);
        }
        RewriteEngine::new(lookup, TargetScope::new(vec!["com/model".to_string()]))
    }

    fn value_ref() -> FieldRef {
        FieldRef::new("com/model/Model", "value", "I")
    }

    fn model() -> CompiledUnit {
        UnitBuilder::new("com/model/Model")
            .field("value", "I")
            .method(
                MethodBuilder::new("getValue", "()I")
                    .max_stack(1)
                    .op(Instruction::Load(0))
                    .op(Instruction::GetField(value_ref()))
                    .op(Instruction::ReturnValue),
            )
            .method(
                MethodBuilder::new("setValue", "(I)V")
                    .max_stack(2)
                    .op(Instruction::Load(0))
                    .op(Instruction::Load(1))
                    .op(Instruction::PutField(value_ref()))
                    .op(Instruction::Return),
            )
            .build()
    }

    fn rewritten(engine: &RewriteEngine, unit: &CompiledUnit) -> (CompiledUnit, RewriteStats) {
        match engine.rewrite(unit) {
            RewriteOutcome::Rewritten { unit, stats } => (unit, stats),
            RewriteOutcome::Unchanged(reason) => panic!("unchanged: {}", reason),
        }
    }

    #[test]
    fn test_read_check_sequence() {
        let (unit, stats) = rewritten(&engine_with(vec![]), &model());
        assert_eq!(stats.sites_instrumented, 2);
        assert_eq!(stats.methods_touched, 2);

        let get = unit.method("getValue", "()I").unwrap();
        assert_eq!(
            &get.code[1..10],
            &[
                Instruction::Dup,
                Instruction::CurrentThread,
                Instruction::Swap,
                Instruction::PushStr("com/model/Model".into()),
                Instruction::PushStr("value".into()),
                Instruction::PushBool(false),
                Instruction::PushBool(true),
                Instruction::PushInt(0),
                Instruction::InvokeStatic(observe_ref()),
            ]
        );
        assert_eq!(get.code[10], Instruction::GetField(value_ref()));
        assert_eq!(get.max_stack, 1 + INSTRUMENTATION_HEADROOM);
        assert!(verify_method(get).is_ok());
    }

    #[test]
    fn test_write_check_keeps_value_below_receiver() {
        let (unit, _) = rewritten(&engine_with(vec![]), &model());
        let set = unit.method("setValue", "(I)V").unwrap();
        assert_eq!(
            &set.code[2..6],
            &[
                Instruction::Dup2,
                Instruction::Pop,
                Instruction::CurrentThread,
                Instruction::Swap
            ]
        );
        assert_eq!(set.code[7], Instruction::PushStr("value".into()));
        assert_eq!(set.code[9], Instruction::PushBool(false));
        assert!(verify_method(set).is_ok());
        assert_eq!(guarded_access(&set.code, 2), Some(&value_ref()));
    }

    #[test]
    fn test_jumps_land_on_checks() {
        // if (flag) value = 1; return
        let unit = UnitBuilder::new("com/model/Model")
            .field("value", "I")
            .method(
                MethodBuilder::new("maybeSet", "(Z)V")
                    .max_stack(2)
                    .op(Instruction::Load(1))
                    .op(Instruction::IfNonZero(3))
                    .op(Instruction::Goto(6))
                    .op(Instruction::Load(0))
                    .op(Instruction::PushInt(1))
                    .op(Instruction::PutField(value_ref()))
                    .op(Instruction::Return),
            )
            .build();
        let (out, _) = rewritten(&engine_with(vec![]), &unit);
        let code = &out.methods[0].code;
        assert_eq!(code[1].branch_target(), Some(3));
        assert_eq!(code[3], Instruction::Load(0));
        let goto_target = code[2].branch_target().unwrap() as usize;
        assert_eq!(goto_target, code.len() - 1);
        assert_eq!(code[goto_target], Instruction::Return);
        assert!(verify_method(&out.methods[0]).is_ok());
    }

    #[test]
    fn test_branch_into_access_hits_check() {
        let unit = UnitBuilder::new("com/model/Model")
            .field("value", "I")
            .method(
                MethodBuilder::new("loop", "()V")
                    .max_stack(1)
                    .op(Instruction::Load(0))
                    .op(Instruction::Goto(2))
                    .op(Instruction::GetField(value_ref()))
                    .op(Instruction::Pop)
                    .op(Instruction::Return),
            )
            .build();
        let (out, _) = rewritten(&engine_with(vec![]), &unit);
        let code = &out.methods[0].code;
        let target = code[1].branch_target().unwrap() as usize;
        assert_eq!(code[target], Instruction::Dup);
        assert_eq!(guarded_access(code, target), Some(&value_ref()));
    }

    #[test]
    fn test_initializers_skipped_unless_tracked() {
        let counter = FieldRef::new("com/model/Model", "counter", "I");
        let early = FieldRef::new("com/model/Model", "early", "I");
        let unit = UnitBuilder::new("com/model/Model")
            .static_field("counter", "I")
            .field_with("early", "I", true, false, &[markers::TRACK_INIT_WRITES])
            .method(
                MethodBuilder::new_static("<clinit>", "()V")
                    .max_stack(1)
                    .op(Instruction::PushInt(1))
                    .op(Instruction::PutStatic(counter))
                    .op(Instruction::PushInt(2))
                    .op(Instruction::PutStatic(early))
                    .op(Instruction::Return),
            )
            .build();
        let engine = engine_with(vec![]);
        let plan = engine.plan(&unit).unwrap();
        assert_eq!(plan.sites.len(), 1);
        assert_eq!(plan.sites[0].field, "early");
        assert!(plan.sites[0].context.contains(SiteContext::DURING_INIT));
        assert_eq!(plan.skipped[0].reason, SkipReason::InitRoutine);
    }

    #[test]
    fn test_excluded_class_and_members() {
        let excluded = UnitBuilder::new("com/model/Model")
            .annotate(markers::EXCLUDED)
            .build();
        let engine = engine_with(vec![]);
        let mut unit = model();
        unit.annotations = excluded.annotations;
        assert!(matches!(
            engine.rewrite(&unit),
            RewriteOutcome::Unchanged(UnchangedReason::ClassExcluded)
        ));

        let mut unit = model();
        unit.fields[0].annotations.push(markers::EXCLUDED.to_string());
        assert!(matches!(
            engine.rewrite(&unit),
            RewriteOutcome::Unchanged(UnchangedReason::NothingToInstrument)
        ));

        let mut unit = model();
        unit.methods[0].annotations.push(markers::EXCLUDED.to_string());
        let plan = engine.plan(&unit).unwrap();
        assert_eq!(plan.sites.len(), 1);
        assert_eq!(plan.skipped[0].reason, SkipReason::MethodExcluded);
    }

    #[test]
    fn test_out_of_scope_owner_needs_no_resolution() {
        let unit = UnitBuilder::new("com/model/Client")
            .method(
                MethodBuilder::new_static("peek", "()I")
                    .max_stack(1)
                    .op(Instruction::GetStatic(FieldRef::new("org/lib/Config", "level", "I")))
                    .op(Instruction::ReturnValue),
            )
            .build();
        assert!(matches!(
            engine_with(vec![]).rewrite(&unit),
            RewriteOutcome::Unchanged(UnchangedReason::NothingToInstrument)
        ));
    }

    #[test]
    fn test_unresolvable_owner_leaves_unit_unchanged() {
        let unit = UnitBuilder::new("com/model/Client")
            .method(
                MethodBuilder::new_static("peek", "()I")
                    .max_stack(1)
                    .op(Instruction::GetStatic(FieldRef::new("com/model/Gone", "x", "I")))
                    .op(Instruction::ReturnValue),
            )
            .build();
        let outcome = engine_with(vec![]).rewrite(&unit);
        assert_eq!(outcome.unchanged_reason().unwrap().label(), "resolution_failure");
    }

    #[test]
    fn test_inherited_field_keyed_by_declaring_type() {
        let base = UnitBuilder::new("com/model/Base").field("count", "I").build();
        let child = UnitBuilder::new("com/model/Child")
            .extends("com/model/Base")
            .method(
                MethodBuilder::new("count", "()I")
                    .max_stack(1)
                    .op(Instruction::Load(0))
                    .op(Instruction::GetField(FieldRef::new("com/model/Child", "count", "I")))
                    .op(Instruction::ReturnValue),
            )
            .build();
        let plan = engine_with(vec![base]).plan(&child).unwrap();
        assert_eq!(plan.sites[0].owner, "com/model/Base");
    }

    #[test]
    fn test_unverifiable_input_is_returned_unchanged() {
        let unit = UnitBuilder::new("com/model/Model")
            .field("value", "I")
            .method(
                MethodBuilder::new("broken", "()V")
                    .op(Instruction::Pop)
                    .op(Instruction::Return),
            )
            .build();
        let outcome = engine_with(vec![]).rewrite(&unit);
        assert_eq!(outcome.unchanged_reason().unwrap().label(), "invalid_input");
    }

    #[test]
    fn test_inconsistent_emission_is_caught() {
        let engine = engine_with(vec![]);
        let original = model();
        let plan = engine.plan(&original).unwrap();
        let (mut emitted, _) = emit(&original, &plan);
        // Drop the Dup of the first check: the access now underflows.
        emitted.methods[0].code.remove(1);
        let err = check_emitted(&original, &emitted).unwrap_err();
        assert!(err.is_rewrite_failure());
        assert!(err.to_string().contains("getValue"));
    }

    #[test]
    fn test_runtime_and_out_of_scope_units() {
        let engine = engine_with(vec![]);
        assert_eq!(
            engine
                .rewrite(&CompiledUnit::new("affinity/runtime/AccessLedger"))
                .unchanged_reason()
                .unwrap()
                .label(),
            "runtime_namespace"
        );
        assert_eq!(
            engine
                .rewrite(&CompiledUnit::new("org/lib/Thing"))
                .unchanged_reason()
                .unwrap()
                .label(),
            "out_of_scope"
        );
    }
}
