//! Rewrite command - run one unit through the loader hook

use affinity_audit_core::loader::TransformOutcome;
use affinity_audit_types::encoding::{base64_encode, encode_unit_as, read_unit_file, UnitFormat};
use affinity_audit_types::{decode_unit, CompiledUnit};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::output::{fail_line, ok_line, print_json};
use super::{hook_with_classpath, load_config, with_targets};

#[derive(Parser, Debug)]
pub struct RewriteCmd {
    /// Unit file (JSON or BCS)
    pub unit: PathBuf,

    /// Directory of units the rewritten unit may reference (repeatable)
    #[arg(long = "classpath", short = 'c')]
    pub classpath: Vec<PathBuf>,

    /// Write the resulting unit here; the extension picks the format
    #[arg(long, short)]
    pub out: Option<PathBuf>,

    /// Instrumentation scope, comma-separated (e.g. `com.model,com.app`)
    #[arg(long)]
    pub targets: Option<String>,
}

#[derive(Debug, Serialize)]
struct RewriteSummary {
    type_name: String,
    rewritten: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    sites_instrumented: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<PathBuf>,
    /// Rewritten raw (BCS) unit, when no output file was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_base64: Option<String>,
}

impl RewriteCmd {
    pub fn execute(&self, config_path: Option<&Path>, json_output: bool) -> Result<()> {
        let config = with_targets(load_config(config_path)?, self.targets.as_deref());
        let hook = hook_with_classpath(&config, &self.classpath)?;
        let unit = read_unit_file(&self.unit)?;
        let type_name = unit.name.clone();

        let outcome = hook.transform_unit(unit.clone());
        let result = match &outcome {
            TransformOutcome::Rewritten(bytes) => {
                decode_unit(bytes).context("Rewritten unit failed to decode")?
            }
            TransformOutcome::Unchanged(_) => unit,
        };
        if let Some(out) = &self.out {
            write_unit(&result, out)?;
        }

        let summary = RewriteSummary {
            type_name,
            rewritten: outcome.is_rewritten(),
            reason: match &outcome {
                TransformOutcome::Unchanged(reason) => Some(reason.to_string()),
                TransformOutcome::Rewritten(_) => None,
            },
            sites_instrumented: hook.metrics().sites_instrumented,
            output: self.out.clone(),
            unit_base64: match &outcome {
                TransformOutcome::Rewritten(bytes) if self.out.is_none() => {
                    Some(base64_encode(bytes))
                }
                _ => None,
            },
        };

        if json_output {
            return print_json(&summary);
        }
        if summary.rewritten {
            println!(
                "{}",
                ok_line(&format!(
                    "{}: {} access site(s) instrumented",
                    summary.type_name, summary.sites_instrumented
                ))
            );
        } else {
            println!(
                "{}",
                fail_line(&format!(
                    "{}: unchanged ({})",
                    summary.type_name,
                    summary.reason.as_deref().unwrap_or("unknown")
                ))
            );
        }
        if let Some(out) = &summary.output {
            println!("Wrote {}", out.display());
        }
        Ok(())
    }
}

/// Write `unit` to `path` in the format its extension selects.
pub fn write_unit(unit: &CompiledUnit, path: &Path) -> Result<()> {
    let bytes = encode_unit_as(unit, UnitFormat::from_path(path))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}
