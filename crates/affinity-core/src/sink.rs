//! Finding sinks.
//!
//! The ledger hands each finding to a [`FindingReporter`], which fans it out to
//! every registered [`FindingSink`]. A sink that fails or panics is counted and
//! logged; nothing from the reporting path reaches instrumented code.
//!
//! | Sink | Destination |
//! |------|-------------|
//! | [`TracingSink`] | `tracing` error event with both stacks |
//! | [`JsonlSink`] | one JSON object per line, appended to a file |
//! | [`CollectingSink`] | in-memory list (tests, scenario reports) |

use crate::ledger::Finding;
use crate::metrics::LedgerMetrics;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

/// Destination for findings.
pub trait FindingSink: Send + Sync {
    fn name(&self) -> &str;

    fn record(&self, finding: &Finding) -> Result<()>;
}

// =============================================================================
// Reporter
// =============================================================================

/// Fan-out of findings to sinks, isolating sink failures.
#[derive(Clone, Default)]
pub struct FindingReporter {
    sinks: Vec<Arc<dyn FindingSink>>,
}

impl FindingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn FindingSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn FindingSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver a finding to every sink.
    pub fn report(&self, finding: &Finding, metrics: &LedgerMetrics) {
        for sink in &self.sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.record(finding))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics.record_sink_failure();
                    warn!(sink = sink.name(), error = %e, "finding sink failed");
                }
                Err(_) => {
                    metrics.record_sink_failure();
                    warn!(sink = sink.name(), "finding sink panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for FindingReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("FindingReporter")
            .field("sinks", &names)
            .finish()
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Logs findings as `tracing` error events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl FindingSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn record(&self, finding: &Finding) -> Result<()> {
        error!(
            finding_id = %finding.id,
            key = %finding.key,
            policy = %finding.policy,
            reader = %finding.reader,
            writer = %finding.writer,
            "{}",
            finding.render()
        );
        Ok(())
    }
}

/// Keeps findings in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    findings: Mutex<Vec<Finding>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.findings.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.findings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.lock().is_empty()
    }

    pub fn clear(&self) {
        self.findings.lock().clear();
    }
}

impl FindingSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    fn record(&self, finding: &Finding) -> Result<()> {
        self.findings.lock().push(finding.clone());
        Ok(())
    }
}

/// Appends findings to a JSONL file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    /// Open (or create) `path` for appending, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open findings log {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FindingSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn record(&self, finding: &Finding) -> Result<()> {
        let line = serde_json::to_string(finding)?;
        let mut file = self.file.lock();
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }
}

/// Read every finding from a JSONL log. Blank lines are skipped.
pub fn read_findings_log(path: &Path) -> Result<Vec<Finding>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open findings log {}", path.display()))?;
    let mut findings = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let finding: Finding = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed finding", path.display(), idx + 1))?;
        findings.push(finding);
    }
    Ok(findings)
}
