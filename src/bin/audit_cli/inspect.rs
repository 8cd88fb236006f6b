//! Inspect command - show exclusion decisions and the instrumentation plan

use affinity_audit_core::rewrite::InstrumentationPlan;
use affinity_audit_types::encoding::read_unit_file;
use affinity_audit_types::CompiledUnit;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use super::output::{heading, print_json};
use super::{hook_with_classpath, load_config, with_targets};

#[derive(Parser, Debug)]
pub struct InspectCmd {
    /// Unit file (JSON or BCS)
    pub unit: PathBuf,

    /// Directory of units the inspected unit may reference (repeatable)
    #[arg(long = "classpath", short = 'c')]
    pub classpath: Vec<PathBuf>,

    /// Instrumentation scope, comma-separated
    #[arg(long)]
    pub targets: Option<String>,
}

impl InspectCmd {
    pub fn execute(&self, config_path: Option<&Path>, json_output: bool) -> Result<()> {
        let config = with_targets(load_config(config_path)?, self.targets.as_deref());
        let hook = hook_with_classpath(&config, &self.classpath)?;
        let unit = hook.lookup().register(read_unit_file(&self.unit)?);

        let plan = hook
            .engine()
            .plan(&unit)
            .with_context(|| format!("Failed to plan instrumentation of {}", unit.name))?;

        if json_output {
            print_json(&plan)
        } else {
            println!("{}", format_plan(&unit, &plan));
            Ok(())
        }
    }
}

fn method_label(unit: &CompiledUnit, index: usize) -> String {
    unit.methods
        .get(index)
        .map(|m| format!("{}{}", m.name, m.descriptor))
        .unwrap_or_else(|| format!("#{}", index))
}

pub fn format_plan(unit: &CompiledUnit, plan: &InstrumentationPlan) -> String {
    let profile = &plan.profile;
    let mut lines = Vec::new();
    lines.push(heading(&format!("Type {}", plan.type_name)));
    if let Some(parent) = &profile.super_name {
        lines.push(format!("  extends {}", parent));
    }
    lines.push(format!("  digest {}", profile.digest));
    if profile.class_excluded {
        match &profile.excluded_via {
            Some(via) => lines.push(format!("  class excluded (inherited from {})", via)),
            None => lines.push("  class excluded".to_string()),
        }
    }

    lines.push(String::new());
    lines.push(heading("Fields"));
    for (name, policy) in &profile.fields {
        let mut flags = Vec::new();
        if policy.is_static {
            flags.push("static");
        }
        if policy.is_final {
            flags.push("final");
        }
        if policy.excluded {
            flags.push("excluded");
        }
        if policy.owner_read_allowed {
            flags.push("owner-read-allowed");
        }
        if policy.static_init_exempt {
            flags.push("init-exempt");
        }
        if policy.track_init_writes {
            flags.push("tracks-init-writes");
        }
        lines.push(format!("  {:<20} {}", name, flags.join(" ")));
    }
    for method in &profile.excluded_methods {
        lines.push(format!("  method {} excluded", method));
    }

    lines.push(String::new());
    lines.push(heading(&format!("Instrumented sites: {}", plan.sites.len())));
    for site in &plan.sites {
        lines.push(format!(
            "  {}:{:<4} {:?} {}.{} [{}]",
            method_label(unit, site.method),
            site.pc,
            site.kind,
            site.owner,
            site.field,
            site.context
        ));
    }
    if !plan.skipped.is_empty() {
        lines.push(String::new());
        lines.push(heading(&format!("Skipped sites: {}", plan.skipped.len())));
        for site in &plan.skipped {
            lines.push(format!(
                "  {}:{:<4} {} ({})",
                method_label(unit, site.method),
                site.pc,
                site.field,
                site.reason
            ));
        }
    }
    lines.join("\n")
}
