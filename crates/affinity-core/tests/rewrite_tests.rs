//! Load-time rewriting through the loader hook, on raw unit bytes.

mod common;

use affinity_audit_core::loader::{LoaderHook, TransformOutcome};
use affinity_audit_core::resolver::LocalUnitResolver;
use affinity_audit_core::rewrite::{guarded_access, is_observe_call, UnchangedReason};
use affinity_audit_core::verify::verify_unit;
use affinity_audit_types::builder::{MethodBuilder, UnitBuilder};
use affinity_audit_types::{decode_unit, encode_unit, markers, CompiledUnit, FieldRef, Instruction};
use common::{init_test_logging, model_builder, model_unit, test_config, MODEL};
use std::sync::Arc;

const SUB: &str = "com/model/Sub";

fn hook() -> LoaderHook {
    init_test_logging();
    LoaderHook::new(&test_config(), Arc::new(LocalUnitResolver::new()))
}

fn transform(hook: &LoaderHook, unit: &CompiledUnit) -> TransformOutcome {
    hook.transform(&unit.name, &encode_unit(unit).unwrap())
}

fn rewritten(outcome: TransformOutcome) -> CompiledUnit {
    match outcome {
        TransformOutcome::Rewritten(bytes) => decode_unit(&bytes).unwrap(),
        TransformOutcome::Unchanged(reason) => panic!("unit left unchanged: {}", reason),
    }
}

fn unchanged_label(outcome: &TransformOutcome) -> &'static str {
    match outcome {
        TransformOutcome::Unchanged(reason) => reason.label(),
        TransformOutcome::Rewritten(_) => "rewritten",
    }
}

/// Number of ledger checks in a method.
fn checks(unit: &CompiledUnit, name: &str) -> usize {
    unit.methods
        .iter()
        .find(|m| m.name == name)
        .map(|m| m.code.iter().filter(|i| is_observe_call(i)).count())
        .unwrap_or(0)
}

/// `com/model/Sub extends Model`, touching the inherited field through its own
/// type name.
fn sub_unit() -> CompiledUnit {
    UnitBuilder::new(SUB)
        .extends(MODEL)
        .method(
            MethodBuilder::new("bump", "()V")
                .op(Instruction::Load(0))
                .op(Instruction::Load(0))
                .op(Instruction::GetField(FieldRef::new(SUB, "value", "I")))
                .op(Instruction::PushInt(1))
                .op(Instruction::Add)
                .op(Instruction::PutField(FieldRef::new(SUB, "value", "I")))
                .op(Instruction::Return),
        )
        .build()
}

#[test]
fn test_every_non_init_access_is_guarded() {
    let hook = hook();
    let unit = rewritten(transform(&hook, &model_unit()));

    assert!(verify_unit(&unit).is_ok());
    assert_eq!(checks(&unit, "<init>"), 0);
    for method in ["setValue", "getValue", "setTotal", "getTotal"] {
        assert_eq!(checks(&unit, method), 1, "{}", method);
    }

    // Each check sits directly in front of the access it guards.
    for method in &unit.methods {
        for (pc, instruction) in method.code.iter().enumerate() {
            if is_observe_call(instruction) {
                let guarded = guarded_access(&method.code, pc)
                    .unwrap_or_else(|| panic!("check at {}:{} guards nothing", method.name, pc));
                assert_eq!(guarded.owner, MODEL);
            }
        }
    }

    let metrics = hook.metrics();
    assert_eq!(metrics.units_rewritten, 1);
    assert_eq!(metrics.sites_instrumented, 4);
}

#[test]
fn test_rewriting_instrumented_bytes_adds_no_checks() {
    let hook = hook();
    let once = match transform(&hook, &model_unit()) {
        TransformOutcome::Rewritten(bytes) => bytes,
        TransformOutcome::Unchanged(reason) => panic!("unit left unchanged: {}", reason),
    };

    let outcome = hook.transform(MODEL, &once);
    assert_eq!(unchanged_label(&outcome), "already_instrumented");
    assert_eq!(outcome.bytes_or(&once), once.as_slice());

    let unit = decode_unit(&once).unwrap();
    for method in ["setValue", "getValue", "setTotal", "getTotal"] {
        assert_eq!(checks(&unit, method), 1, "{}", method);
    }
    let metrics = hook.metrics();
    assert_eq!(metrics.units_rewritten, 1);
    assert_eq!(metrics.sites_instrumented, 4);
}

#[test]
fn test_partly_instrumented_unit_gets_only_missing_checks() {
    let hook = hook();
    let mut unit = rewritten(transform(&hook, &model_unit()));
    // A fresh, unguarded method next to the instrumented ones.
    let plain = MethodBuilder::new("peek", "()I")
        .op(Instruction::Load(0))
        .op(Instruction::GetField(FieldRef::new(MODEL, "value", "I")))
        .op(Instruction::ReturnValue)
        .build();
    unit.methods.push(plain);

    let again = rewritten(transform(&hook, &unit));
    for method in ["setValue", "getValue", "setTotal", "getTotal", "peek"] {
        assert_eq!(checks(&again, method), 1, "{}", method);
    }
    assert!(verify_unit(&again).is_ok());
}

#[test]
fn test_inherited_field_reports_declaring_type() {
    let hook = hook();
    assert!(transform(&hook, &model_unit()).is_rewritten());
    let sub = rewritten(transform(&hook, &sub_unit()));

    assert_eq!(checks(&sub, "bump"), 2);
    let bump = &sub.methods[0];
    assert!(bump
        .code
        .contains(&Instruction::PushStr(MODEL.to_string())));
    assert!(!bump.code.contains(&Instruction::PushStr(SUB.to_string())));
}

#[test]
fn test_unregistered_supertype_is_a_resolution_failure() {
    let hook = hook();
    let outcome = transform(&hook, &sub_unit());
    assert_eq!(unchanged_label(&outcome), "resolution_failure");
    assert_eq!(hook.metrics().resolution_failures, 1);
    // The unit is registered anyway.
    assert!(hook.lookup().contains(SUB));
}

#[test]
fn test_excluded_type_is_left_unchanged() {
    let hook = hook();
    let unit = model_builder().annotate(markers::EXCLUDED).build();
    let original = encode_unit(&unit).unwrap();
    let outcome = hook.transform(&unit.name, &original);

    assert!(matches!(
        outcome,
        TransformOutcome::Unchanged(UnchangedReason::ClassExcluded)
    ));
    assert_eq!(outcome.bytes_or(&original), original.as_slice());
}

#[test]
fn test_excluded_subtype_inherits_exclusion() {
    let hook = hook();
    let parent = model_builder().annotate(markers::EXCLUDED).build();
    transform(&hook, &parent);
    let outcome = transform(&hook, &sub_unit());
    assert_eq!(unchanged_label(&outcome), "class_excluded");
}

#[test]
fn test_batch_keeps_input_order() {
    let hook = hook();
    let model = encode_unit(&model_unit()).unwrap();
    let batch = vec![
        (MODEL.to_string(), model),
        ("java/util/List".to_string(), vec![0xff, 0x00]),
        ("affinity/runtime/Threads".to_string(), vec![1, 2, 3]),
        ("com/model/Broken".to_string(), b"not a unit".to_vec()),
    ];

    let outcomes = hook.transform_batch(&batch);
    let labels: Vec<&str> = outcomes.iter().map(unchanged_label).collect();
    assert_eq!(
        labels,
        vec!["rewritten", "out_of_scope", "runtime_namespace", "invalid_input"]
    );

    let metrics = hook.metrics();
    assert_eq!(metrics.units_seen, 4);
    assert_eq!(metrics.units_out_of_scope, 2);
    assert_eq!(metrics.invalid_inputs, 1);
    assert_eq!(metrics.units_rewritten, 1);
}

#[test]
fn test_batch_resolves_supertypes_listed_later() {
    let hook = hook();
    let batch = vec![
        (SUB.to_string(), encode_unit(&sub_unit()).unwrap()),
        (MODEL.to_string(), encode_unit(&model_unit()).unwrap()),
    ];

    let outcomes = hook.transform_batch(&batch);
    let labels: Vec<&str> = outcomes.iter().map(unchanged_label).collect();
    assert_eq!(labels, vec!["rewritten", "rewritten"]);
    assert_eq!(hook.metrics().resolution_failures, 0);
}

#[test]
fn test_json_units_are_accepted_by_the_lookup() {
    let lookup = Arc::new(LocalUnitResolver::new());
    let raw = serde_json::to_vec(&model_unit()).unwrap();
    lookup.register_raw(&raw).unwrap();
    assert!(lookup.contains(MODEL));
}
