#![allow(dead_code)]
//! Shared helpers for affinity-core integration tests.
//!
//! - `init_test_logging`: one-time tracing subscriber writing to the test harness
//! - `model_unit`: the `com/model/Model` fixture used across suites
//! - `audited_sandbox`: a sandbox whose units went through the loader hook

use affinity_audit_core::config::AuditConfig;
use affinity_audit_core::ledger::{build_ledger, AccessLedger};
use affinity_audit_core::loader::LoaderHook;
use affinity_audit_core::resolver::LocalUnitResolver;
use affinity_audit_core::sandbox::{Sandbox, SandboxConfig};
use affinity_audit_core::sink::{CollectingSink, FindingReporter};
use affinity_audit_types::builder::{MethodBuilder, UnitBuilder};
use affinity_audit_types::{CompiledUnit, FieldRef, Instruction};
use std::sync::{Arc, Once};

pub const MODEL: &str = "com/model/Model";
pub const OWNER_MARKER: &str = "RSM-Thread-";

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging once per test binary. `RUST_LOG` overrides the
/// default `debug` filter.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

pub fn test_config() -> AuditConfig {
    AuditConfig::default().with_owner_marker(OWNER_MARKER)
}

fn value_ref() -> FieldRef {
    FieldRef::new(MODEL, "value", "I")
}

fn total_ref() -> FieldRef {
    FieldRef::new(MODEL, "total", "I")
}

/// `com/model/Model` with one instance field, one static field, and
/// accessors for both. The constructor initializes `value`.
pub fn model_unit() -> CompiledUnit {
    model_builder().build()
}

/// Start of [`model_unit`], for tests that add annotations.
pub fn model_builder() -> UnitBuilder {
    UnitBuilder::new(MODEL)
        .field("value", "I")
        .static_field("total", "I")
        .method(
            MethodBuilder::new("<init>", "()V")
                .op(Instruction::Load(0))
                .op(Instruction::PushInt(1))
                .op(Instruction::PutField(value_ref()))
                .op(Instruction::Return),
        )
        .method(
            MethodBuilder::new("setValue", "(I)V")
                .op(Instruction::Load(0))
                .op(Instruction::Load(1))
                .op(Instruction::PutField(value_ref()))
                .op(Instruction::Return),
        )
        .method(
            MethodBuilder::new("getValue", "()I")
                .op(Instruction::Load(0))
                .op(Instruction::GetField(value_ref()))
                .op(Instruction::ReturnValue),
        )
        .method(
            MethodBuilder::new_static("setTotal", "(I)V")
                .op(Instruction::Load(0))
                .op(Instruction::PutStatic(total_ref()))
                .op(Instruction::Return),
        )
        .method(
            MethodBuilder::new_static("getTotal", "()I")
                .op(Instruction::GetStatic(total_ref()))
                .op(Instruction::ReturnValue),
        )
}

/// A sandbox wired to a collecting sink, with `units` loaded through a
/// loader hook built from `config`.
pub fn audited_sandbox(
    config: &AuditConfig,
    units: Vec<CompiledUnit>,
) -> (Sandbox, Arc<CollectingSink>, Arc<dyn AccessLedger>) {
    init_test_logging();
    let sink = Arc::new(CollectingSink::new());
    let ledger = build_ledger(config, FindingReporter::new().with_sink(sink.clone()));
    let sandbox = Sandbox::new(ledger.clone(), SandboxConfig::default());
    let hook = LoaderHook::new(config, Arc::new(LocalUnitResolver::new()));
    sandbox
        .load_through(&hook, units)
        .expect("units load through the hook");
    (sandbox, sink, ledger)
}
