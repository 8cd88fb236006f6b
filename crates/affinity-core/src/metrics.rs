//! Counters for the ledger and the loader hook.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Ledger Metrics
// =============================================================================

/// Ledger operation counters (thread-safe).
#[derive(Debug, Default)]
pub struct LedgerMetrics {
    observations: AtomicU64,
    skipped: AtomicU64,
    writes_recorded: AtomicU64,
    findings: AtomicU64,
    violations: AtomicU64,
    sink_failures: AtomicU64,
}

impl LedgerMetrics {
    /// Record one call into the ledger.
    pub fn record_observation(&self) {
        self.observations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an access dropped by its site context.
    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an Other write stored as the key's write record.
    pub fn record_write(&self) {
        self.writes_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finding handed to the sinks.
    pub fn record_finding(&self) {
        self.findings.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a strict-alternation violation returned to a caller.
    pub fn record_violation(&self) {
        self.violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sink that failed or panicked.
    pub fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LedgerMetricsSnapshot {
        LedgerMetricsSnapshot {
            observations: self.observations.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            writes_recorded: self.writes_recorded.load(Ordering::Relaxed),
            findings: self.findings.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.observations.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.writes_recorded.store(0, Ordering::Relaxed);
        self.findings.store(0, Ordering::Relaxed);
        self.violations.store(0, Ordering::Relaxed);
        self.sink_failures.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`LedgerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMetricsSnapshot {
    pub observations: u64,
    pub skipped: u64,
    pub writes_recorded: u64,
    pub findings: u64,
    pub violations: u64,
    pub sink_failures: u64,
}

impl LedgerMetricsSnapshot {
    pub fn format_report(&self) -> String {
        let mut lines = Vec::new();
        lines.push("Ledger Metrics".to_string());
        lines.push("=".repeat(50));
        lines.push(format!("  Observations:    {}", self.observations));
        lines.push(format!("  Skipped:         {}", self.skipped));
        lines.push(format!("  Writes recorded: {}", self.writes_recorded));
        lines.push(format!("  Findings:        {}", self.findings));
        lines.push(format!("  Violations:      {}", self.violations));
        lines.push(format!("  Sink failures:   {}", self.sink_failures));
        lines.join("\n")
    }
}

// =============================================================================
// Loader Metrics
// =============================================================================

/// Loader hook counters, shared by every loading thread.
#[derive(Debug, Clone, Default)]
pub struct LoaderMetrics {
    /// Units handed to the hook
    pub units_seen: Arc<AtomicU64>,
    /// Units returned with instrumentation
    pub units_rewritten: Arc<AtomicU64>,
    /// Units outside the instrumentation scope or in the runtime namespace
    pub units_out_of_scope: Arc<AtomicU64>,
    /// Units returned unchanged because of class exclusion or nothing to instrument
    pub units_untouched: Arc<AtomicU64>,
    /// Units skipped because a referenced type could not be resolved
    pub resolution_failures: Arc<AtomicU64>,
    /// Units whose rewrite failed verification or encoding
    pub rewrite_failures: Arc<AtomicU64>,
    /// Raw units that could not be decoded or did not verify
    pub invalid_inputs: Arc<AtomicU64>,
    /// Access sites instrumented across all units
    pub sites_instrumented: Arc<AtomicU64>,
}

impl LoaderMetrics {
    pub fn record_seen(&self) {
        self.units_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rewritten(&self, sites: usize) {
        self.units_rewritten.fetch_add(1, Ordering::Relaxed);
        self.sites_instrumented
            .fetch_add(sites as u64, Ordering::Relaxed);
    }

    pub fn record_out_of_scope(&self) {
        self.units_out_of_scope.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_untouched(&self) {
        self.units_untouched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolution_failure(&self) {
        self.resolution_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rewrite_failure(&self) {
        self.rewrite_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_input(&self) {
        self.invalid_inputs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoaderMetricsSnapshot {
        LoaderMetricsSnapshot {
            units_seen: self.units_seen.load(Ordering::Relaxed),
            units_rewritten: self.units_rewritten.load(Ordering::Relaxed),
            units_out_of_scope: self.units_out_of_scope.load(Ordering::Relaxed),
            units_untouched: self.units_untouched.load(Ordering::Relaxed),
            resolution_failures: self.resolution_failures.load(Ordering::Relaxed),
            rewrite_failures: self.rewrite_failures.load(Ordering::Relaxed),
            invalid_inputs: self.invalid_inputs.load(Ordering::Relaxed),
            sites_instrumented: self.sites_instrumented.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.units_seen.store(0, Ordering::Relaxed);
        self.units_rewritten.store(0, Ordering::Relaxed);
        self.units_out_of_scope.store(0, Ordering::Relaxed);
        self.units_untouched.store(0, Ordering::Relaxed);
        self.resolution_failures.store(0, Ordering::Relaxed);
        self.rewrite_failures.store(0, Ordering::Relaxed);
        self.invalid_inputs.store(0, Ordering::Relaxed);
        self.sites_instrumented.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of loader metrics (for reporting).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderMetricsSnapshot {
    pub units_seen: u64,
    pub units_rewritten: u64,
    pub units_out_of_scope: u64,
    pub units_untouched: u64,
    pub resolution_failures: u64,
    pub rewrite_failures: u64,
    pub invalid_inputs: u64,
    pub sites_instrumented: u64,
}

impl LoaderMetricsSnapshot {
    /// Share of in-scope units that came back instrumented.
    pub fn rewrite_rate(&self) -> f64 {
        let in_scope = self.units_seen.saturating_sub(self.units_out_of_scope);
        if in_scope == 0 {
            return 0.0;
        }
        self.units_rewritten as f64 / in_scope as f64
    }

    pub fn format_report(&self) -> String {
        let mut lines = Vec::new();
        lines.push("Loader Metrics".to_string());
        lines.push("=".repeat(50));
        lines.push(format!("  Units seen:          {}", self.units_seen));
        lines.push(format!("  Rewritten:           {}", self.units_rewritten));
        lines.push(format!("  Out of scope:        {}", self.units_out_of_scope));
        lines.push(format!("  Untouched:           {}", self.units_untouched));
        lines.push(format!("  Resolution failures: {}", self.resolution_failures));
        lines.push(format!("  Rewrite failures:    {}", self.rewrite_failures));
        lines.push(format!("  Invalid inputs:      {}", self.invalid_inputs));
        lines.push(format!("  Sites instrumented:  {}", self.sites_instrumented));
        lines.push(format!(
            "  Rewrite rate:        {:.1}%",
            self.rewrite_rate() * 100.0
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_metrics_reset() {
        let metrics = LedgerMetrics::default();
        metrics.record_observation();
        metrics.record_observation();
        metrics.record_finding();
        let snap = metrics.snapshot();
        assert_eq!(snap.observations, 2);
        assert_eq!(snap.findings, 1);
        assert!(snap.format_report().contains("Findings:        1"));

        metrics.reset();
        assert_eq!(metrics.snapshot(), LedgerMetricsSnapshot::default());
    }

    #[test]
    fn test_loader_metrics_shared_across_clones() {
        let metrics = LoaderMetrics::default();
        let clone = metrics.clone();
        clone.record_seen();
        clone.record_seen();
        clone.record_out_of_scope();
        metrics.record_rewritten(3);

        let snap = metrics.snapshot();
        assert_eq!(snap.units_seen, 2);
        assert_eq!(snap.sites_instrumented, 3);
        assert!((snap.rewrite_rate() - 1.0).abs() < f64::EPSILON);
    }
}
