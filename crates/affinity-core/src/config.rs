//! Audit configuration.
//!
//! [`AuditConfig`] gathers every setting the pipeline reads: the thread naming
//! convention, the detection policy, the instrumentation scope and the
//! diagnostics options. Values come from (in increasing precedence) defaults,
//! an optional JSON file, `AFFINITY_*` environment variables and explicit
//! builder calls.
//!
//! ```
//! use affinity_audit_core::config::AuditConfig;
//! use affinity_audit_core::ledger::DetectionPolicy;
//!
//! let config = AuditConfig::default()
//!     .with_owner_marker("RSM-Thread-")
//!     .with_policy(DetectionPolicy::StrictAlternation)
//!     .with_target_prefixes(vec!["com/model".to_string()]);
//! assert!(config.in_scope("com/model/Model"));
//! assert!(!config.in_scope("com/other/Thing"));
//! ```

use crate::classifier::{MatchMode, ThreadClassifier, DEFAULT_OWNER_MARKER};
use crate::errors::ConfigError;
use crate::ledger::DetectionPolicy;
use crate::stack::DEFAULT_MAX_STACK_DEPTH;
use affinity_audit_types::env_utils::{env_bool_or, env_list, env_string, env_var, split_list};
use affinity_audit_types::unit::RUNTIME_NAMESPACE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Instrumentation scope used when none is configured.
pub const DEFAULT_TARGET_PREFIX: &str = "com/model";

/// Default directory for findings logs, under the home directory.
pub const DEFAULT_LOG_DIR: &str = ".affinity-audit";

pub const ENV_OWNER_MARKER: &str = "AFFINITY_OWNER_MARKER";
pub const ENV_MATCH_MODE: &str = "AFFINITY_MATCH_MODE";
pub const ENV_POLICY: &str = "AFFINITY_POLICY";
pub const ENV_TARGETS: &str = "AFFINITY_TARGETS";
pub const ENV_STACK_DEPTH: &str = "AFFINITY_STACK_DEPTH";
pub const ENV_CAPTURE_STACKS: &str = "AFFINITY_CAPTURE_STACKS";
pub const ENV_FINDINGS_LOG: &str = "AFFINITY_FINDINGS_LOG";

/// Configuration for one audit session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Thread-name marker identifying Owner threads (default: `CONTRACT_WORKER`).
    pub owner_marker: String,

    /// How the marker is compared against thread names (default: prefix).
    pub match_mode: MatchMode,

    /// Detection policy of the ledger (default: write-dominance).
    pub policy: DetectionPolicy,

    /// Type-name prefixes whose units are instrumented (default: `com/model`).
    ///
    /// Prefixes match on package boundaries: `com/model` covers
    /// `com/model/Model` and `com/model/sub/Item` but not `com/models/X`.
    pub target_prefixes: Vec<String>,

    /// Capture the writer's stack for every recorded write (default: true).
    ///
    /// Disabling this makes Other writes cheaper; findings then carry an
    /// empty writer stack.
    pub capture_write_stacks: bool,

    /// Frames kept per stack snapshot (default: 10).
    pub max_stack_depth: usize,

    /// Append findings to this JSONL file (default: none).
    pub findings_log: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            owner_marker: DEFAULT_OWNER_MARKER.to_string(),
            match_mode: MatchMode::default(),
            policy: DetectionPolicy::default(),
            target_prefixes: vec![DEFAULT_TARGET_PREFIX.to_string()],
            capture_write_stacks: true,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            findings_log: None,
        }
    }
}

impl AuditConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON config file. Missing keys keep their defaults.
    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: AuditConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AFFINITY_*` environment overrides.
    pub fn apply_env(mut self) -> Self {
        if let Some(marker) = env_string(ENV_OWNER_MARKER) {
            self.owner_marker = marker;
        }
        if let Some(mode) = env_string(ENV_MATCH_MODE) {
            self.match_mode = MatchMode::from_str_loose(&mode);
        }
        if let Some(policy) = env_string(ENV_POLICY) {
            self.policy = DetectionPolicy::from_str_loose(&policy);
        }
        let targets = env_list(ENV_TARGETS);
        if !targets.is_empty() {
            self.target_prefixes = targets.iter().map(|t| normalize_prefix(t)).collect();
        }
        if let Some(depth) = env_var::<usize>(ENV_STACK_DEPTH) {
            self.max_stack_depth = depth;
        }
        self.capture_write_stacks = env_bool_or(ENV_CAPTURE_STACKS, self.capture_write_stacks);
        if let Some(path) = env_string(ENV_FINDINGS_LOG) {
            self.findings_log = Some(PathBuf::from(path));
        }
        self
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    pub fn with_owner_marker(mut self, marker: impl Into<String>) -> Self {
        self.owner_marker = marker.into();
        self
    }

    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode;
        self
    }

    pub fn with_policy(mut self, policy: DetectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_target_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.target_prefixes = prefixes.iter().map(|p| normalize_prefix(p)).collect();
        self
    }

    /// Set the scope from a loader argument string such as `com.model,com/other`.
    pub fn with_agent_args(self, args: &str) -> Self {
        let prefixes = parse_agent_args(args);
        self.with_target_prefixes(prefixes)
    }

    pub fn with_capture_write_stacks(mut self, capture: bool) -> Self {
        self.capture_write_stacks = capture;
        self
    }

    pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }

    pub fn with_findings_log(mut self, path: Option<PathBuf>) -> Self {
        self.findings_log = path;
        self
    }

    pub fn classifier(&self) -> ThreadClassifier {
        ThreadClassifier::new(self.owner_marker.clone(), self.match_mode)
    }

    pub fn scope(&self) -> TargetScope {
        TargetScope::new(self.target_prefixes.clone())
    }

    /// Whether units of `type_name` are instrumented.
    pub fn in_scope(&self, type_name: &str) -> bool {
        scope_contains(&self.target_prefixes, type_name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner_marker.trim().is_empty() {
            return Err(ConfigError {
                key: "owner_marker",
                value: self.owner_marker.clone(),
                reason: "must not be empty",
            });
        }
        if let Some(bad) = self.target_prefixes.iter().find(|p| p.trim().is_empty()) {
            return Err(ConfigError {
                key: "target_prefixes",
                value: bad.clone(),
                reason: "entries must not be empty",
            });
        }
        Ok(())
    }
}

/// Instrumentation scope: the type-name prefixes whose fields are tracked.
///
/// The runtime namespace is never in scope. An empty prefix list puts every
/// other type in scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetScope {
    prefixes: Vec<String>,
}

impl TargetScope {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        scope_contains(&self.prefixes, type_name)
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

fn scope_contains(prefixes: &[String], type_name: &str) -> bool {
    if type_name.starts_with(RUNTIME_NAMESPACE) {
        return false;
    }
    if prefixes.is_empty() {
        return true;
    }
    prefixes.iter().any(|prefix| {
        type_name
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

/// Default findings log location (`~/.affinity-audit/findings.jsonl`).
pub fn default_findings_log() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_LOG_DIR).join("findings.jsonl"))
}

/// Parse loader arguments into scope prefixes. Dotted package names are
/// accepted; an empty argument selects [`DEFAULT_TARGET_PREFIX`].
pub fn parse_agent_args(args: &str) -> Vec<String> {
    let prefixes: Vec<String> = split_list(args)
        .iter()
        .map(|p| normalize_prefix(p))
        .filter(|p| !p.is_empty())
        .collect();
    if prefixes.is_empty() {
        vec![DEFAULT_TARGET_PREFIX.to_string()]
    } else {
        prefixes
    }
}

fn normalize_prefix(prefix: &str) -> String {
    prefix.trim().replace('.', "/").trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuditConfig::default();
        assert_eq!(config.owner_marker, "CONTRACT_WORKER");
        assert_eq!(config.match_mode, MatchMode::Prefix);
        assert_eq!(config.policy, DetectionPolicy::WriteDominance);
        assert_eq!(config.max_stack_depth, 10);
        assert!(config.capture_write_stacks);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scope_matches_package_boundaries() {
        let config = AuditConfig::default();
        assert!(config.in_scope("com/model/Model"));
        assert!(config.in_scope("com/model/sub/Item"));
        assert!(!config.in_scope("com/models/Model"));
        assert!(!config.in_scope("affinity/runtime/AccessLedger"));

        let everything = AuditConfig::default().with_target_prefixes(vec![]).scope();
        assert!(everything.contains("any/Type"));
        assert!(!everything.contains("affinity/annotation/Excluded"));
    }

    #[test]
    fn test_agent_args() {
        assert_eq!(parse_agent_args(""), vec!["com/model"]);
        assert_eq!(
            parse_agent_args("com.example.app, org/demo/"),
            vec!["com/example/app", "org/demo"]
        );
        let config = AuditConfig::default().with_agent_args("org.demo");
        assert!(config.in_scope("org/demo/Widget"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        std::fs::write(&path, r#"{"owner_marker": "RSM-Thread-", "policy": "strict_alternation"}"#)
            .unwrap();
        let config = AuditConfig::load_file(&path).unwrap();
        assert_eq!(config.owner_marker, "RSM-Thread-");
        assert_eq!(config.policy, DetectionPolicy::StrictAlternation);
        assert_eq!(config.target_prefixes, vec!["com/model"]);
    }

    #[test]
    fn test_validate_rejects_empty_marker() {
        let err = AuditConfig::default()
            .with_owner_marker(" ")
            .validate()
            .unwrap_err();
        assert_eq!(err.key, "owner_marker");
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var(ENV_OWNER_MARKER, "RSM-Thread-");
        std::env::set_var(ENV_POLICY, "strict");
        std::env::set_var(ENV_TARGETS, "com.example,org/demo");
        std::env::set_var(ENV_CAPTURE_STACKS, "false");

        let config = AuditConfig::from_env();
        assert_eq!(config.owner_marker, "RSM-Thread-");
        assert_eq!(config.policy, DetectionPolicy::StrictAlternation);
        assert_eq!(config.target_prefixes, vec!["com/example", "org/demo"]);
        assert!(!config.capture_write_stacks);

        std::env::remove_var(ENV_OWNER_MARKER);
        std::env::remove_var(ENV_POLICY);
        std::env::remove_var(ENV_TARGETS);
        std::env::remove_var(ENV_CAPTURE_STACKS);
    }
}
