//! # Scenarios
//!
//! A scenario is a JSON description of an audited program run: the units to
//! load, configuration overrides, and ordered phases of concurrently running
//! sandbox threads. Running one produces a [`ScenarioReport`] with the findings,
//! thread failures and metrics.
//!
//! ```text
//! {
//!   "name": "instance-field",
//!   "config": { "owner_marker": "RSM-Thread-" },
//!   "unit_files": ["units/Model.json"],
//!   "phases": [
//!     { "name": "setup", "threads": [
//!       { "name": "main", "steps": [
//!         { "op": "new", "type": "com/model/Model", "bind": "o1" },
//!         { "op": "invoke_virtual", "target": "o1", "method": "setValue",
//!           "descriptor": "(I)V", "args": [5] } ] } ] },
//!     { "name": "read", "threads": [
//!       { "name": "RSM-Thread-1", "steps": [
//!         { "op": "invoke_virtual", "target": "o1", "method": "getValue",
//!           "descriptor": "()I", "bind": "seen" } ] } ] }
//!   ]
//! }
//! ```
//!
//! Phases run one after another; threads inside a phase run concurrently.
//! Objects bound by one step are visible to every later step of any thread.

use crate::classifier::MatchMode;
use crate::config::AuditConfig;
use crate::errors::ExecutionError;
use crate::ledger::{build_ledger, DetectionPolicy, Finding, UNNAMED_THREAD};
use crate::loader::LoaderHook;
use crate::metrics::{LedgerMetricsSnapshot, LoaderMetricsSnapshot};
use crate::resolver::LocalUnitResolver;
use crate::sandbox::{LoadedUnit, Sandbox, SandboxConfig, Value};
use crate::sink::{CollectingSink, FindingReporter, JsonlSink, TracingSink};
use affinity_audit_types::encoding::read_unit_file;
use affinity_audit_types::CompiledUnit;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Scenario Description
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: ConfigOverrides,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Inline units.
    #[serde(default)]
    pub units: Vec<CompiledUnit>,
    /// Unit files, relative to the scenario file.
    #[serde(default)]
    pub unit_files: Vec<PathBuf>,
    pub phases: Vec<Phase>,
}

/// Settings a scenario may override on top of the session configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub owner_marker: Option<String>,
    pub match_mode: Option<MatchMode>,
    pub policy: Option<DetectionPolicy>,
    pub target_prefixes: Option<Vec<String>>,
    pub capture_write_stacks: Option<bool>,
    pub max_stack_depth: Option<usize>,
}

impl ConfigOverrides {
    pub fn apply(&self, mut config: AuditConfig) -> AuditConfig {
        if let Some(marker) = &self.owner_marker {
            config = config.with_owner_marker(marker.clone());
        }
        if let Some(mode) = self.match_mode {
            config = config.with_match_mode(mode);
        }
        if let Some(policy) = self.policy {
            config = config.with_policy(policy);
        }
        if let Some(prefixes) = &self.target_prefixes {
            config = config.with_target_prefixes(prefixes.clone());
        }
        if let Some(capture) = self.capture_write_stacks {
            config = config.with_capture_write_stacks(capture);
        }
        if let Some(depth) = self.max_stack_depth {
            config = config.with_max_stack_depth(depth);
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub threads: Vec<ThreadSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSpec {
    /// `None` runs an unnamed thread.
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<Step>,
    /// The thread is expected to fail (e.g. a strict-alternation violation).
    #[serde(default)]
    pub expect_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Instantiate a type and bind the new object.
    New {
        #[serde(rename = "type")]
        type_name: String,
        bind: String,
        #[serde(default = "default_constructor")]
        descriptor: String,
        #[serde(default)]
        args: Vec<Arg>,
    },
    InvokeStatic {
        owner: String,
        method: String,
        descriptor: String,
        #[serde(default)]
        args: Vec<Arg>,
        #[serde(default)]
        bind: Option<String>,
    },
    InvokeVirtual {
        /// Binding of the receiver.
        target: String,
        method: String,
        descriptor: String,
        #[serde(default)]
        args: Vec<Arg>,
        #[serde(default)]
        bind: Option<String>,
    },
}

fn default_constructor() -> String {
    "()V".to_string()
}

/// Step argument: a literal or a bound object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Bool(bool),
    Int(i64),
    Object { object: String },
    Str(String),
}

impl Scenario {
    /// Load a scenario file and the unit files it references.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let mut scenario = Self::from_json(&raw)
            .with_context(|| format!("Invalid scenario {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for file in std::mem::take(&mut scenario.unit_files) {
            let full = base.join(&file);
            let unit = read_unit_file(&full)
                .with_context(|| format!("Scenario {} references {}", scenario.name, file.display()))?;
            scenario.units.push(unit);
        }
        Ok(scenario)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse scenario JSON")
    }

    /// Session configuration with this scenario's overrides applied.
    pub fn effective_config(&self, base: &AuditConfig) -> AuditConfig {
        self.config.apply(base.clone())
    }

    /// Load the units through a fresh loader hook and run every phase.
    pub fn run(&self, base: &AuditConfig) -> Result<ScenarioReport> {
        let config = self.effective_config(base);
        config.validate().context("Invalid scenario configuration")?;

        let collected = Arc::new(CollectingSink::new());
        let mut reporter = FindingReporter::new()
            .with_sink(collected.clone())
            .with_sink(Arc::new(TracingSink));
        if let Some(path) = &config.findings_log {
            reporter.add_sink(Arc::new(JsonlSink::open(path)?));
        }

        let ledger = build_ledger(&config, reporter);
        let hook = LoaderHook::new(&config, Arc::new(LocalUnitResolver::new()));
        let sandbox = Sandbox::new(ledger.clone(), self.sandbox);
        let loaded = sandbox.load_through(&hook, self.units.clone())?;

        info!(scenario = %self.name, policy = %config.policy, phases = self.phases.len(), "running scenario");
        let run = self.run_phases(&sandbox)?;

        let mut findings = collected.findings();
        findings.sort_by_key(|f| f.observed_at);
        Ok(ScenarioReport {
            scenario: self.name.clone(),
            policy: config.policy,
            loaded,
            findings,
            failures: run.failures,
            bindings: run.bindings,
            ledger: ledger.metrics(),
            loader: hook.metrics(),
        })
    }

    /// Run every phase against an already loaded sandbox.
    pub fn run_phases(&self, sandbox: &Sandbox) -> Result<PhaseRun> {
        let bindings: Mutex<HashMap<String, Value>> = Mutex::new(HashMap::new());
        let mut failures = Vec::new();

        for phase in &self.phases {
            info!(phase = %phase.name, threads = phase.threads.len(), "starting phase");
            std::thread::scope(|scope| -> Result<()> {
                let mut handles = Vec::with_capacity(phase.threads.len());
                for spec in &phase.threads {
                    let mut builder = std::thread::Builder::new();
                    if let Some(name) = &spec.name {
                        builder = builder.name(name.clone());
                    }
                    let bindings = &bindings;
                    let handle = builder
                        .spawn_scoped(scope, move || run_thread(sandbox, spec, bindings))
                        .with_context(|| format!("Failed to spawn thread in phase {}", phase.name))?;
                    handles.push((spec, handle));
                }
                for (spec, handle) in handles {
                    let thread = spec.name.clone().unwrap_or_else(|| UNNAMED_THREAD.to_string());
                    let error = match handle.join() {
                        Ok(Ok(())) => {
                            if spec.expect_failure {
                                warn!(phase = %phase.name, thread = %thread, "thread expected to fail completed");
                            }
                            continue;
                        }
                        Ok(Err(e)) => e,
                        Err(_) => ExecutionError::ThreadPanicked {
                            thread: thread.clone(),
                        },
                    };
                    if !spec.expect_failure {
                        warn!(phase = %phase.name, thread = %thread, error = %error, "sandbox thread failed");
                    }
                    failures.push(ThreadFailure {
                        phase: phase.name.clone(),
                        thread,
                        violation: error.is_violation(),
                        expected: spec.expect_failure,
                        error: error.to_string(),
                    });
                }
                Ok(())
            })?;
        }

        let bindings = bindings
            .into_inner()
            .into_iter()
            .map(|(name, value)| (name, value.to_string()))
            .collect();
        Ok(PhaseRun { failures, bindings })
    }
}

fn run_thread(
    sandbox: &Sandbox,
    spec: &ThreadSpec,
    bindings: &Mutex<HashMap<String, Value>>,
) -> Result<(), ExecutionError> {
    let mut thread = sandbox.new_thread(spec.name.as_deref());
    for step in &spec.steps {
        match step {
            Step::New {
                type_name,
                bind,
                descriptor,
                args,
            } => {
                let args = resolve_args(args, bindings)?;
                let object = sandbox.instantiate(&mut thread, type_name, descriptor, args)?;
                bindings.lock().insert(bind.clone(), object);
            }
            Step::InvokeStatic {
                owner,
                method,
                descriptor,
                args,
                bind,
            } => {
                let args = resolve_args(args, bindings)?;
                let result = sandbox.invoke_static(&mut thread, owner, method, descriptor, args)?;
                bind_result(bindings, bind, result);
            }
            Step::InvokeVirtual {
                target,
                method,
                descriptor,
                args,
                bind,
            } => {
                let receiver = lookup_binding(bindings, target)?;
                let args = resolve_args(args, bindings)?;
                let result = sandbox.invoke_virtual(&mut thread, receiver, method, descriptor, args)?;
                bind_result(bindings, bind, result);
            }
        }
    }
    Ok(())
}

fn resolve_args(
    args: &[Arg],
    bindings: &Mutex<HashMap<String, Value>>,
) -> Result<Vec<Value>, ExecutionError> {
    args.iter()
        .map(|arg| match arg {
            Arg::Bool(v) => Ok(Value::Bool(*v)),
            Arg::Int(v) => Ok(Value::Int(*v)),
            Arg::Str(s) => Ok(Value::str(s)),
            Arg::Object { object } => lookup_binding(bindings, object),
        })
        .collect()
}

fn lookup_binding(
    bindings: &Mutex<HashMap<String, Value>>,
    name: &str,
) -> Result<Value, ExecutionError> {
    bindings
        .lock()
        .get(name)
        .cloned()
        .ok_or_else(|| ExecutionError::NullReference {
            context: format!("unbound object '{}'", name),
        })
}

fn bind_result(bindings: &Mutex<HashMap<String, Value>>, bind: &Option<String>, result: Option<Value>) {
    if let Some(name) = bind {
        bindings
            .lock()
            .insert(name.clone(), result.unwrap_or(Value::Null));
    }
}

// =============================================================================
// Reports
// =============================================================================

/// A sandbox thread that stopped with an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadFailure {
    pub phase: String,
    pub thread: String,
    pub error: String,
    /// Stopped by a strict-alternation violation.
    pub violation: bool,
    pub expected: bool,
}

/// Failures and final bindings of a phase run.
#[derive(Debug, Clone, Default)]
pub struct PhaseRun {
    pub failures: Vec<ThreadFailure>,
    /// Bound values, rendered.
    pub bindings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub policy: DetectionPolicy,
    pub loaded: Vec<LoadedUnit>,
    pub findings: Vec<Finding>,
    pub failures: Vec<ThreadFailure>,
    pub bindings: BTreeMap<String, String>,
    pub ledger: LedgerMetricsSnapshot,
    pub loader: LoaderMetricsSnapshot,
}

impl ScenarioReport {
    pub fn unexpected_failures(&self) -> impl Iterator<Item = &ThreadFailure> {
        self.failures.iter().filter(|f| !f.expected)
    }

    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn format_report(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("Scenario: {} ({})", self.scenario, self.policy));
        lines.push("=".repeat(50));
        for unit in &self.loaded {
            match &unit.reason {
                Some(reason) => lines.push(format!("  loaded {} unchanged: {}", unit.name, reason)),
                None => lines.push(format!("  loaded {} (instrumented)", unit.name)),
            }
        }
        lines.push(String::new());
        lines.push(format!("Findings: {}", self.findings.len()));
        for finding in &self.findings {
            lines.push(finding.render());
        }
        if !self.failures.is_empty() {
            lines.push(String::new());
            lines.push(format!("Thread failures: {}", self.failures.len()));
            for failure in &self.failures {
                lines.push(format!(
                    "  [{}] {}: {}{}",
                    failure.phase,
                    failure.thread,
                    failure.error,
                    if failure.expected { " (expected)" } else { "" }
                ));
            }
        }
        if !self.bindings.is_empty() {
            lines.push(String::new());
            lines.push("Bindings:".to_string());
            for (name, value) in &self.bindings {
                lines.push(format!("  {} = {}", name, value));
            }
        }
        lines.push(String::new());
        lines.push(self.ledger.format_report());
        lines.push(String::new());
        lines.push(self.loader.format_report());
        lines.join("\n")
    }
}
