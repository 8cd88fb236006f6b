//! Strict-alternation policy.
//!
//! The first non-skipped access to a key (read or write) pins it to the
//! accessing thread's category. Every later access from the other category is
//! a violation returned to the caller; the sinks hear about the key once.

use super::{
    AccessLedger, DetectionPolicy, FieldAccess, Finding, LedgerCore, LedgerSnapshot, Pin,
    SiteContext,
};
use crate::config::AuditConfig;
use crate::errors::AffinityViolation;
use crate::metrics::LedgerMetricsSnapshot;
use crate::sink::FindingReporter;
use crate::stack::{StackSnapshot, ThreadView};
use affinity_audit_types::Category;
use chrono::Utc;
use tracing::debug;

/// Ledger implementing [`DetectionPolicy::StrictAlternation`].
pub struct StrictAlternationLedger {
    core: LedgerCore,
}

impl StrictAlternationLedger {
    pub fn new(config: &AuditConfig, reporter: FindingReporter) -> Self {
        Self {
            core: LedgerCore::new(config, reporter),
        }
    }
}

impl AccessLedger for StrictAlternationLedger {
    fn policy(&self) -> DetectionPolicy {
        DetectionPolicy::StrictAlternation
    }

    fn observe(
        &self,
        thread: &dyn ThreadView,
        access: &FieldAccess<'_>,
    ) -> Result<(), AffinityViolation> {
        self.core.metrics.record_observation();
        if access.context.is_excluded() {
            self.core.metrics.record_skip();
            return Ok(());
        }
        let category = self.core.classifier.classify(thread.name());
        if category == Category::Owner
            && access.is_read
            && access.context.contains(SiteContext::OWNER_READ_ALLOWED)
        {
            self.core.metrics.record_skip();
            return Ok(());
        }

        let cell = match self
            .core
            .cells
            .get(access.owner, access.field, access.receiver)
        {
            Some(cell) => cell,
            None => self.core.cells.get_or_insert(&access.key()),
        };

        let pin = {
            let mut state = cell.state();
            if state.pin.is_none() {
                state.pin = Some(Pin {
                    category,
                    thread: LedgerCore::thread_name(thread),
                });
                debug!(key = %cell.key(), %category, "key pinned");
                return Ok(());
            }
            match state.pin.as_ref() {
                Some(pin) if pin.category != category => pin.clone(),
                _ => return Ok(()),
            }
        };

        let violation = AffinityViolation {
            key: cell.key().clone(),
            thread: LedgerCore::thread_name(thread),
            category,
            pinned_to: pin.category,
            pinned_by: pin.thread.clone(),
            is_read: access.is_read,
        };
        self.core.metrics.record_violation();

        if cell.try_flag() {
            let finding = Finding {
                id: uuid::Uuid::new_v4().to_string(),
                policy: DetectionPolicy::StrictAlternation,
                key: violation.key.clone(),
                is_read: access.is_read,
                reader: violation.thread.clone(),
                reader_category: category,
                reader_stack: thread.capture_stack(self.core.max_stack_depth),
                writer: pin.thread,
                writer_category: pin.category,
                writer_stack: StackSnapshot::empty(),
                writer_during_init: false,
                observed_at: Utc::now(),
            };
            self.core.report(&finding);
        }
        Err(violation)
    }

    fn reset(&self) {
        self.core.reset();
    }

    fn snapshot(&self) -> LedgerSnapshot {
        self.core.snapshot(DetectionPolicy::StrictAlternation)
    }

    fn metrics(&self) -> LedgerMetricsSnapshot {
        self.core.metrics.snapshot()
    }
}
