//! Report command - summarize a findings log by owning type

use affinity_audit_core::ledger::{DetectionPolicy, Finding};
use affinity_audit_core::sink::read_findings_log;
use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::output::{heading, print_json};

#[derive(Parser, Debug)]
pub struct ReportCmd {
    /// Findings log (JSONL)
    pub log: PathBuf,

    /// Only findings on this owner type (slashed or dotted)
    #[arg(long)]
    pub owner: Option<String>,

    /// Print every finding with both stacks
    #[arg(long)]
    pub full: bool,
}

/// Findings on one owner type.
#[derive(Debug, Serialize)]
pub struct OwnerSummary {
    pub owner: String,
    pub findings: usize,
    pub write_dominance: usize,
    pub strict_alternation: usize,
    pub fields: BTreeSet<String>,
    pub writers: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ReportCmd {
    pub fn execute(&self, json_output: bool, verbose: bool) -> Result<()> {
        let owner = self.owner.as_deref().map(|o| o.replace('.', "/"));
        let findings: Vec<Finding> = read_findings_log(&self.log)?
            .into_iter()
            .filter(|f| owner.as_deref().map_or(true, |o| f.key.owner() == o))
            .collect();
        let summaries = summarize(&findings);

        if json_output {
            return print_json(&summaries);
        }

        println!(
            "{}",
            heading(&format!(
                "{} finding(s) across {} type(s) in {}",
                findings.len(),
                summaries.len(),
                self.log.display()
            ))
        );
        println!("{}", "=".repeat(50));
        for summary in &summaries {
            println!(
                "{}  {} finding(s) ({} write-dominance, {} strict)",
                summary.owner, summary.findings, summary.write_dominance, summary.strict_alternation
            );
            println!(
                "  fields: {}",
                summary.fields.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            println!(
                "  writers: {}",
                summary.writers.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            println!(
                "  seen: {} .. {}",
                summary.first_seen.format("%Y-%m-%d %H:%M:%S"),
                summary.last_seen.format("%Y-%m-%d %H:%M:%S")
            );
        }
        if self.full || verbose {
            println!();
            for finding in &findings {
                println!("{}", finding.render());
            }
        }
        Ok(())
    }
}

/// Group findings by owner type, sorted by type name.
pub fn summarize(findings: &[Finding]) -> Vec<OwnerSummary> {
    let mut groups: BTreeMap<&str, OwnerSummary> = BTreeMap::new();
    for finding in findings {
        let summary = groups
            .entry(finding.key.owner())
            .or_insert_with(|| OwnerSummary {
                owner: finding.key.owner().to_string(),
                findings: 0,
                write_dominance: 0,
                strict_alternation: 0,
                fields: BTreeSet::new(),
                writers: BTreeSet::new(),
                first_seen: finding.observed_at,
                last_seen: finding.observed_at,
            });
        summary.findings += 1;
        match finding.policy {
            DetectionPolicy::WriteDominance => summary.write_dominance += 1,
            DetectionPolicy::StrictAlternation => summary.strict_alternation += 1,
        }
        summary.fields.insert(finding.key.field().to_string());
        summary.writers.insert(finding.writer.clone());
        summary.first_seen = summary.first_seen.min(finding.observed_at);
        summary.last_seen = summary.last_seen.max(finding.observed_at);
    }
    groups.into_values().collect()
}
