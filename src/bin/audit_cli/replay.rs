//! Replay command - run a scenario on the audited sandbox

use affinity_audit_core::config::default_findings_log;
use affinity_audit_core::scenario::Scenario;
use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;

use super::output::{fail_line, ok_line, print_json};
use super::load_config;

#[derive(Parser, Debug)]
pub struct ReplayCmd {
    /// Scenario file (JSON)
    pub scenario: PathBuf,

    /// Exit non-zero when any finding is reported
    #[arg(long)]
    pub fail_on_findings: bool,

    /// Append findings to this JSONL log
    #[arg(long, conflicts_with = "log_default")]
    pub findings_log: Option<PathBuf>,

    /// Append findings to the default log (~/.affinity-audit/findings.jsonl)
    #[arg(long)]
    pub log_default: bool,
}

impl ReplayCmd {
    pub fn execute(&self, config_path: Option<&Path>, json_output: bool) -> Result<()> {
        let mut config = load_config(config_path)?;
        if let Some(path) = &self.findings_log {
            config = config.with_findings_log(Some(path.clone()));
        } else if self.log_default {
            config = config.with_findings_log(default_findings_log());
        }

        let scenario = Scenario::load(&self.scenario)?;
        let report = scenario.run(&config)?;
        info!(
            scenario = %report.scenario,
            findings = report.findings.len(),
            failures = report.failures.len(),
            "scenario finished"
        );

        if json_output {
            print_json(&report)?;
        } else {
            println!("{}", report.format_report());
            println!();
            if report.has_findings() {
                println!(
                    "{}",
                    fail_line(&format!("{} finding(s)", report.findings.len()))
                );
            } else {
                println!("{}", ok_line("no findings"));
            }
        }

        let unexpected = report.unexpected_failures().count();
        if unexpected > 0 {
            return Err(anyhow!(
                "{} sandbox thread(s) failed unexpectedly in scenario {}",
                unexpected,
                report.scenario
            ));
        }
        if self.fail_on_findings && report.has_findings() {
            return Err(anyhow!(
                "scenario {} produced {} finding(s)",
                report.scenario,
                report.findings.len()
            ));
        }
        Ok(())
    }
}
