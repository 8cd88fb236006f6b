//! Verify command - check operand-stack consistency of units

use affinity_audit_core::verify::{verify_unit, VerifyReport};
use affinity_audit_types::encoding::read_unit_file;
use affinity_audit_types::CompiledUnit;
use anyhow::{anyhow, Result};
use clap::Parser;
use rayon::prelude::*;
use std::path::PathBuf;

use super::output::{fail_line, heading, ok_line, print_json};

#[derive(Parser, Debug)]
pub struct VerifyCmd {
    /// Unit files (JSON or BCS)
    #[arg(required = true)]
    pub units: Vec<PathBuf>,

    /// Also print each method's instructions
    #[arg(long)]
    pub listing: bool,
}

impl VerifyCmd {
    pub fn execute(&self, json_output: bool) -> Result<()> {
        let units: Vec<CompiledUnit> = self
            .units
            .par_iter()
            .map(|path| read_unit_file(path))
            .collect::<Result<Vec<_>>>()?;
        let reports: Vec<VerifyReport> = units.par_iter().map(verify_unit).collect();

        let failed = reports.iter().filter(|r| !r.is_ok()).count();
        if json_output {
            print_json(&reports)?;
        } else {
            for report in &reports {
                for method in &report.methods {
                    let label = format!("{}.{}", report.type_name, method.signature());
                    match (&method.error, method.max_depth) {
                        (None, Some(depth)) => {
                            println!("{}", ok_line(&format!("{} (max stack {})", label, depth)))
                        }
                        (Some(e), _) => println!("{}", fail_line(&format!("{}: {}", label, e))),
                        (None, None) => println!("{}", ok_line(&label)),
                    }
                }
            }
            if self.listing {
                for unit in &units {
                    println!();
                    println!("{}", format_listing(unit));
                }
            }
        }

        if failed > 0 {
            return Err(anyhow!("{} of {} unit(s) failed verification", failed, reports.len()));
        }
        Ok(())
    }
}

/// Instructions of every method, one per line with its pc.
pub fn format_listing(unit: &CompiledUnit) -> String {
    let mut lines = vec![heading(&unit.name)];
    for method in &unit.methods {
        lines.push(format!(
            "  {}{} (max_stack {}, max_locals {})",
            method.name, method.descriptor, method.max_stack, method.max_locals
        ));
        for (pc, instruction) in method.code.iter().enumerate() {
            lines.push(format!("    {:>4}: {:?}", pc, instruction));
        }
    }
    lines.join("\n")
}
