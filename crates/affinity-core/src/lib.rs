//! Affinity Audit Core
//!
//! Dynamic thread-affinity auditing for managed units.
//!
//! Fields of audited types are expected to be written by one category of
//! threads (the *owner* threads, recognised by a name marker) and read by the
//! other. The core instruments field accesses at load time so that every
//! access is reported to an [`AccessLedger`](ledger::AccessLedger), which flags
//! accesses that break the expected ownership.
//!
//! # Features
//!
//! - **Access ledger**: write-dominance and strict-alternation detection
//! - **Load-time rewriting**: ledger checks inserted ahead of field accesses
//! - **Exclusions**: per-type and per-field opt-outs resolved through supertypes
//! - **Sandbox**: a small multithreaded interpreter to run instrumented units
//! - **Scenarios**: JSON-described runs with phases of concurrent threads
//!
//! # Core Modules
//!
//! - [`ledger`]: detection policies and findings
//! - [`classifier`]: thread categorisation by name
//! - [`exclusion`]: exclusion profiles and field resolution
//! - [`rewrite`]: instrumentation planning and emission
//! - [`loader`]: the load-time hook that drives the rewrite
//! - [`sandbox`]: the interpreter and its runtime natives
//! - [`scenario`]: scenario description and execution
//!
//! # Example
//!
//! ```ignore
//! use affinity_audit_core::config::AuditConfig;
//! use affinity_audit_core::scenario::Scenario;
//!
//! let config = AuditConfig::from_env();
//! let scenario = Scenario::load(Path::new("scenarios/instance.json"))?;
//! let report = scenario.run(&config)?;
//! println!("{}", report.format_report());
//! ```

#![allow(clippy::result_large_err)]

pub mod classifier;
pub mod config;
pub mod errors;
pub mod exclusion;
pub mod ledger;
pub mod loader;
pub mod metrics;
pub mod resolver;
pub mod rewrite;
pub mod sandbox;
pub mod scenario;
pub mod sink;
pub mod stack;
pub mod verify;

pub use classifier::{MatchMode, ThreadClassifier};
pub use config::{AuditConfig, TargetScope};
pub use errors::{AffinityViolation, ExecutionError, RewriteError};
pub use exclusion::{ExclusionProfile, ExclusionResolver, ResolutionSession};
pub use ledger::{build_ledger, AccessLedger, DetectionPolicy, FieldAccess, Finding};
pub use loader::{LoaderHook, TransformOutcome};
pub use resolver::{LocalUnitResolver, TypeLookup};
pub use rewrite::{RewriteEngine, RewriteOutcome, UnchangedReason};
pub use sandbox::{Sandbox, SandboxConfig, Value};
pub use scenario::{Scenario, ScenarioReport};
pub use sink::{FindingReporter, FindingSink};
pub use stack::ThreadView;
