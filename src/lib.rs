//! Affinity Audit
//!
//! Dynamic thread-affinity auditing for managed units:
//!
//! - **Load-time rewriting**: ledger checks inserted ahead of field accesses
//! - **Write-dominance detection**: owner reads of values written elsewhere
//! - **Strict alternation**: keys pinned to the first accessing thread category
//! - **Scenario replay**: audited runs on a multithreaded sandbox
//!
//! The engine lives in [`affinity_audit_core`]; this crate re-exports it and
//! adds the pieces shared by the command-line tool.

#![allow(clippy::result_large_err)]

pub mod logging;

pub use affinity_audit_core as core;
pub use affinity_audit_types as types;

pub use affinity_audit_core::{
    build_ledger, AccessLedger, AuditConfig, DetectionPolicy, Finding, LoaderHook, Scenario,
    ScenarioReport,
};
