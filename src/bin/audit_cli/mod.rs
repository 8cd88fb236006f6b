//! CLI subcommand implementations for affinity-audit

pub mod convert;
pub mod inspect;
pub mod output;
pub mod replay;
pub mod report;
pub mod rewrite;
pub mod verify;

use affinity_audit_core::config::AuditConfig;
use affinity_audit_core::loader::LoaderHook;
use affinity_audit_core::resolver::LocalUnitResolver;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Session configuration: the config file when given, then `AFFINITY_*`
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<AuditConfig> {
    let config = match path {
        Some(path) => AuditConfig::load_file(path)?,
        None => AuditConfig::default(),
    };
    let config = config.apply_env();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Apply a `--targets` override (comma-separated, dotted or slashed names).
pub fn with_targets(config: AuditConfig, targets: Option<&str>) -> AuditConfig {
    match targets {
        Some(targets) => config.with_agent_args(targets),
        None => config,
    }
}

/// A loader hook whose lookup path holds every unit under `classpath`.
pub fn hook_with_classpath(config: &AuditConfig, classpath: &[PathBuf]) -> Result<LoaderHook> {
    let lookup = Arc::new(LocalUnitResolver::new());
    for dir in classpath {
        let count = lookup
            .load_dir(dir)
            .with_context(|| format!("Failed to load classpath entry {}", dir.display()))?;
        debug!(dir = %dir.display(), units = count, "classpath entry loaded");
    }
    Ok(LoaderHook::new(config, lookup))
}
