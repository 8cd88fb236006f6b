//! affinity-audit: thread-affinity auditing for managed units
//!
//! ## Commands
//!
//! - **rewrite**: run a unit through the load-time hook and write the result
//! - **inspect**: show exclusion decisions and the planned checks for a unit
//! - **verify**: check operand-stack consistency of units
//! - **convert**: re-encode units between JSON and BCS
//! - **replay**: run a scenario on the audited sandbox and report findings
//! - **report**: summarize a findings log by owning type
//!
//! ## Example Usage
//!
//! ```bash
//! # Instrument a unit whose supertypes live in ./units
//! affinity-audit rewrite units/Model.json --classpath units --out out/Model.bcs
//!
//! # Replay a scenario, failing CI when something is found
//! affinity-audit replay scenarios/instance.json --fail-on-findings
//!
//! # Summarize everything logged so far
//! affinity-audit report ~/.affinity-audit/findings.jsonl
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod audit_cli;

use audit_cli::{
    convert::ConvertCmd, inspect::InspectCmd, replay::ReplayCmd, report::ReportCmd,
    rewrite::RewriteCmd, verify::VerifyCmd,
};

#[derive(Parser)]
#[command(
    name = "affinity-audit",
    author,
    version,
    about = "Dynamic thread-affinity auditing",
    long_about = "Instruments field accesses of managed units at load time and reports\n\
                  owner-thread reads of values written by other threads."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Audit configuration file (JSON); AFFINITY_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (debug logging)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Instrument one unit through the loader hook
    Rewrite(RewriteCmd),

    /// Show exclusion decisions and the instrumentation plan of a unit
    Inspect(InspectCmd),

    /// Verify operand-stack consistency of units
    Verify(VerifyCmd),

    /// Re-encode a unit between JSON and BCS
    Convert(ConvertCmd),

    /// Run a scenario on the audited sandbox
    Replay(ReplayCmd),

    /// Summarize a findings log
    Report(ReportCmd),
}

fn main() {
    let Cli {
        command,
        config,
        json,
        verbose,
    } = Cli::parse();
    affinity_audit::logging::init(verbose);

    if let Err(err) = run(command, config, json, verbose) {
        eprint!("{}", audit_cli::output::format_error(&err, json));
        if json {
            eprintln!();
        }
        std::process::exit(1);
    }
}

fn run(command: Commands, config: Option<PathBuf>, json: bool, verbose: bool) -> Result<()> {
    let config = config.as_deref();
    match command {
        Commands::Rewrite(cmd) => cmd.execute(config, json),
        Commands::Inspect(cmd) => cmd.execute(config, json),
        Commands::Verify(cmd) => cmd.execute(json),
        Commands::Convert(cmd) => cmd.execute(json),
        Commands::Replay(cmd) => cmd.execute(config, json),
        Commands::Report(cmd) => cmd.execute(json, verbose),
    }
}
