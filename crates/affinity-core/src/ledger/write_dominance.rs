//! Write-dominance policy.
//!
//! Other-category writes are remembered per key (latest wins). The first
//! Owner-category read of a key holding such a record produces a finding and
//! flags the key; flagged keys are never examined again. Owner writes and
//! Other reads do not touch ledger state.

use super::{
    AccessLedger, DetectionPolicy, FieldAccess, Finding, LedgerCore, LedgerSnapshot,
    SiteContext, WriteRecord,
};
use crate::config::AuditConfig;
use crate::errors::AffinityViolation;
use crate::metrics::LedgerMetricsSnapshot;
use crate::sink::FindingReporter;
use crate::stack::{StackSnapshot, ThreadView};
use affinity_audit_types::Category;
use chrono::Utc;
use std::sync::Arc;
use tracing::trace;

/// Ledger implementing [`DetectionPolicy::WriteDominance`].
pub struct WriteDominanceLedger {
    core: LedgerCore,
}

impl WriteDominanceLedger {
    pub fn new(config: &AuditConfig, reporter: FindingReporter) -> Self {
        Self {
            core: LedgerCore::new(config, reporter),
        }
    }

    fn on_owner_read(&self, thread: &dyn ThreadView, access: &FieldAccess<'_>) {
        let Some(cell) = self
            .core
            .cells
            .get(access.owner, access.field, access.receiver)
        else {
            return;
        };
        if cell.is_flagged() {
            return;
        }

        let record = {
            let state = cell.state();
            let Some(record) = state.record.as_ref() else {
                return;
            };
            if record.during_init && access.context.contains(SiteContext::INIT_EXEMPT) {
                return;
            }
            if !cell.try_flag() {
                return;
            }
            record.clone()
        };

        let finding = Finding {
            id: uuid::Uuid::new_v4().to_string(),
            policy: DetectionPolicy::WriteDominance,
            key: cell.key().clone(),
            is_read: true,
            reader: LedgerCore::thread_name(thread),
            reader_category: Category::Owner,
            reader_stack: thread.capture_stack(self.core.max_stack_depth),
            writer: record.writer,
            writer_category: Category::Other,
            writer_stack: Arc::unwrap_or_clone(record.stack),
            writer_during_init: record.during_init,
            observed_at: Utc::now(),
        };
        self.core.report(&finding);
    }

    fn on_other_write(&self, thread: &dyn ThreadView, access: &FieldAccess<'_>) {
        let cell = self.core.cells.get_or_insert(&access.key());
        if cell.is_flagged() {
            return;
        }
        let stack = if self.core.capture_write_stacks {
            thread.capture_stack(self.core.max_stack_depth)
        } else {
            StackSnapshot::empty()
        };
        let record = WriteRecord {
            writer: LedgerCore::thread_name(thread),
            stack: Arc::new(stack),
            during_init: access.context.contains(SiteContext::DURING_INIT),
            recorded_at: Utc::now(),
        };
        cell.state().record = Some(record);
        self.core.metrics.record_write();
    }
}

impl AccessLedger for WriteDominanceLedger {
    fn policy(&self) -> DetectionPolicy {
        DetectionPolicy::WriteDominance
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
        match (category, access.is_read) {
            (Category::Owner, true) => {
                if access.context.contains(SiteContext::OWNER_READ_ALLOWED) {
                    self.core.metrics.record_skip();
                    return Ok(());
                }
                self.on_owner_read(thread, access);
            }
            (Category::Other, false) => self.on_other_write(thread, access),
            _ => {
                trace!(
                    owner = access.owner,
                    field = access.field,
                    %category,
                    "access does not affect write-dominance state"
                );
            }
        }
        Ok(())
    }

    fn reset(&self) {
        self.core.reset();
    }

    fn snapshot(&self) -> LedgerSnapshot {
        self.core.snapshot(DetectionPolicy::WriteDominance)
    }

    fn metrics(&self) -> LedgerMetricsSnapshot {
        self.core.metrics.snapshot()
    }
}
