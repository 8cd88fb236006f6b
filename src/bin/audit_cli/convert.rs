//! Convert command - re-encode a unit between JSON and BCS

use affinity_audit_types::encoding::read_unit_file;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use super::output::{ok_line, print_json};
use super::rewrite::write_unit;

#[derive(Parser, Debug)]
pub struct ConvertCmd {
    /// Input unit (`.json` is read as JSON, anything else as BCS)
    pub input: PathBuf,

    /// Output path (`.json` writes JSON, anything else BCS)
    pub output: PathBuf,
}

impl ConvertCmd {
    pub fn execute(&self, json_output: bool) -> Result<()> {
        let unit = read_unit_file(&self.input)?;
        write_unit(&unit, &self.output)?;
        if json_output {
            print_json(&serde_json::json!({
                "type_name": unit.name,
                "output": self.output,
            }))
        } else {
            println!(
                "{}",
                ok_line(&format!("{} -> {}", unit.name, self.output.display()))
            );
            Ok(())
        }
    }
}
