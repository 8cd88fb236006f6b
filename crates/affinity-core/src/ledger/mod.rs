//! # Access Ledger
//!
//! The concurrent detection engine. Instrumented code reports every qualifying
//! field access through [`AccessLedger::observe`]; the ledger classifies the
//! accessing thread, keeps per-key state and decides when a violation of the
//! thread-affinity discipline has occurred.
//!
//! ## Policies
//!
//! | Policy | Ledger | Behavior |
//! |--------|--------|----------|
//! | [`DetectionPolicy::WriteDominance`] | [`WriteDominanceLedger`] | Owner read of a value last written by an Other thread produces one finding per key; execution continues |
//! | [`DetectionPolicy::StrictAlternation`] | [`StrictAlternationLedger`] | first access pins the key to a category; any access from the other category fails |
//!
//! A ledger instance implements exactly one policy, chosen at construction.
//!
//! ## Key state
//!
//! ```text
//! CellArena (16 shards, RwLock)
//!   owner ─► field ─► receiver? ─► Arc<KeyCell>
//!                                   ├── flagged: AtomicBool   (fire-once)
//!                                   └── Mutex<CellState>
//!                                         ├── record: Option<WriteRecord>
//!                                         └── pin:    Option<Pin>
//! ```
//!
//! Lookups borrow the owner and field as `&str`, so reads of keys that were
//! never written do not allocate.

mod cells;
mod strict;
mod write_dominance;

pub use strict::StrictAlternationLedger;
pub use write_dominance::WriteDominanceLedger;

pub(crate) use cells::{CellArena, Pin};

use crate::classifier::ThreadClassifier;
use crate::config::AuditConfig;
use crate::errors::AffinityViolation;
use crate::metrics::{LedgerMetrics, LedgerMetricsSnapshot};
use crate::sink::FindingReporter;
use crate::stack::{StackSnapshot, ThreadView};
use affinity_audit_types::{Category, FieldKey, ReceiverId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Name used for threads without one.
pub const UNNAMED_THREAD: &str = "<unnamed>";

// =============================================================================
// Policy
// =============================================================================

/// Detection policy implemented by a ledger instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionPolicy {
    /// Owner reads of Other-written values are reported once per key.
    #[default]
    WriteDominance,
    /// Keys are pinned to the first accessing category.
    StrictAlternation,
}

impl DetectionPolicy {
    /// Parse from string (case-insensitive). Unknown values fall back to
    /// write-dominance.
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "strict" | "strict_alternation" | "alternation" | "pin" => Self::StrictAlternation,
            _ => Self::WriteDominance,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WriteDominance => "write_dominance",
            Self::StrictAlternation => "strict_alternation",
        }
    }
}

impl fmt::Display for DetectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Site Context
// =============================================================================

/// Per-site exemption bits computed at rewrite time and passed to the ledger
/// as a plain integer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteContext(u32);

impl SiteContext {
    pub const CLASS_EXCLUDED: u32 = 1 << 0;
    pub const METHOD_EXCLUDED: u32 = 1 << 1;
    pub const FIELD_EXCLUDED: u32 = 1 << 2;
    pub const OWNER_READ_ALLOWED: u32 = 1 << 3;
    /// Writes recorded during initialization never produce findings.
    pub const INIT_EXEMPT: u32 = 1 << 4;
    /// The access site is inside a construction or static-initialization routine.
    pub const DURING_INIT: u32 = 1 << 5;

    const ALL: u32 = (1 << 6) - 1;
    const EXCLUDED: u32 = Self::CLASS_EXCLUDED | Self::METHOD_EXCLUDED | Self::FIELD_EXCLUDED;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Unknown bits are dropped.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    /// Bits as passed through the instrumentation call (an `I` argument).
    pub fn from_int(value: i64) -> Self {
        Self::from_bits(value as u32)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    #[must_use]
    pub const fn with(self, flag: u32) -> Self {
        Self(self.0 | (flag & Self::ALL))
    }

    /// Any class, method or field exclusion applies.
    pub const fn is_excluded(self) -> bool {
        self.0 & Self::EXCLUDED != 0
    }
}

impl fmt::Display for SiteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u32, &str); 6] = [
            (SiteContext::CLASS_EXCLUDED, "class_excluded"),
            (SiteContext::METHOD_EXCLUDED, "method_excluded"),
            (SiteContext::FIELD_EXCLUDED, "field_excluded"),
            (SiteContext::OWNER_READ_ALLOWED, "owner_read_allowed"),
            (SiteContext::INIT_EXEMPT, "init_exempt"),
            (SiteContext::DURING_INIT, "during_init"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&set.join("|"))
        }
    }
}

// =============================================================================
// Access Description
// =============================================================================

/// One observed field access, as reported by instrumented code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldAccess<'a> {
    /// Declaring type of the field.
    pub owner: &'a str,
    pub field: &'a str,
    /// `None` for static fields.
    pub receiver: Option<ReceiverId>,
    pub is_read: bool,
    pub context: SiteContext,
}

impl<'a> FieldAccess<'a> {
    pub fn instance_read(owner: &'a str, field: &'a str, receiver: ReceiverId) -> Self {
        Self {
            owner,
            field,
            receiver: Some(receiver),
            is_read: true,
            context: SiteContext::empty(),
        }
    }

    pub fn instance_write(owner: &'a str, field: &'a str, receiver: ReceiverId) -> Self {
        Self {
            is_read: false,
            ..Self::instance_read(owner, field, receiver)
        }
    }

    pub fn static_read(owner: &'a str, field: &'a str) -> Self {
        Self {
            owner,
            field,
            receiver: None,
            is_read: true,
            context: SiteContext::empty(),
        }
    }

    pub fn static_write(owner: &'a str, field: &'a str) -> Self {
        Self {
            is_read: false,
            ..Self::static_read(owner, field)
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: SiteContext) -> Self {
        self.context = context;
        self
    }

    pub fn is_static(&self) -> bool {
        self.receiver.is_none()
    }

    /// Owned key for this access. Allocates; keep off the read fast path.
    pub fn key(&self) -> FieldKey {
        match self.receiver {
            Some(receiver) => FieldKey::instance(self.owner, self.field, receiver),
            None => FieldKey::of_static(self.owner, self.field),
        }
    }
}

// =============================================================================
// Records and Findings
// =============================================================================

/// The most recent Other-category write to a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub writer: String,
    pub stack: Arc<StackSnapshot>,
    /// Recorded inside a construction or static-initialization routine.
    pub during_init: bool,
    pub recorded_at: DateTime<Utc>,
}

/// A detected discipline violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub policy: DetectionPolicy,
    pub key: FieldKey,
    pub is_read: bool,
    /// Thread whose access produced the finding.
    pub reader: String,
    pub reader_category: Category,
    pub reader_stack: StackSnapshot,
    /// Thread that wrote (write-dominance) or pinned (strict alternation) the key.
    pub writer: String,
    pub writer_category: Category,
    pub writer_stack: StackSnapshot,
    pub writer_during_init: bool,
    pub observed_at: DateTime<Utc>,
}

impl Finding {
    /// One-line description.
    pub fn summary(&self) -> String {
        match self.policy {
            DetectionPolicy::WriteDominance => format!(
                "Invalid read: {} thread '{}' read {} last written by {} thread '{}'{}",
                self.reader_category,
                self.reader,
                self.key,
                self.writer_category,
                self.writer,
                if self.writer_during_init {
                    " during initialization"
                } else {
                    ""
                }
            ),
            DetectionPolicy::StrictAlternation => format!(
                "Affinity violation: {} thread '{}' {} {} pinned to {} thread '{}'",
                self.reader_category,
                self.reader,
                if self.is_read { "read" } else { "wrote" },
                self.key,
                self.writer_category,
                self.writer
            ),
        }
    }

    /// Summary followed by both stacks.
    pub fn render(&self) -> String {
        let mut out = self.summary();
        out.push_str(&format!("\n  {} stack ({}):", self.reader_category, self.reader));
        if !self.reader_stack.is_empty() {
            out.push('\n');
            out.push_str(&self.reader_stack.to_string());
        }
        out.push_str(&format!("\n  {} stack ({}):", self.writer_category, self.writer));
        if !self.writer_stack.is_empty() {
            out.push('\n');
            out.push_str(&self.writer_stack.to_string());
        }
        out
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Category a key is pinned to under strict alternation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedCategory {
    pub category: Category,
    pub thread: String,
}

/// State of one key at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    pub key: FieldKey,
    pub record: Option<WriteRecord>,
    pub pinned: Option<PinnedCategory>,
    pub flagged: bool,
}

/// Immutable copy of a ledger's per-key state, sorted by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub policy: DetectionPolicy,
    pub keys: Vec<KeyState>,
}

impl LedgerSnapshot {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, key: &FieldKey) -> Option<&KeyState> {
        self.keys
            .binary_search_by(|state| state.key.cmp(key))
            .ok()
            .map(|idx| &self.keys[idx])
    }

    pub fn record(&self, key: &FieldKey) -> Option<&WriteRecord> {
        self.get(key).and_then(|state| state.record.as_ref())
    }

    pub fn is_flagged(&self, key: &FieldKey) -> bool {
        self.get(key).is_some_and(|state| state.flagged)
    }

    pub fn flagged_keys(&self) -> Vec<&FieldKey> {
        self.keys
            .iter()
            .filter(|state| state.flagged)
            .map(|state| &state.key)
            .collect()
    }
}

// =============================================================================
// AccessLedger Trait
// =============================================================================

/// The detection engine interface instrumented code talks to.
///
/// Implementations are safe to call from any number of threads at once and
/// never block on anything but short per-key critical sections.
pub trait AccessLedger: Send + Sync {
    fn policy(&self) -> DetectionPolicy;

    /// Observe one access. Only strict alternation ever returns `Err`.
    fn observe(
        &self,
        thread: &dyn ThreadView,
        access: &FieldAccess<'_>,
    ) -> Result<(), AffinityViolation>;

    /// Drop all per-key state and counters.
    fn reset(&self);

    fn snapshot(&self) -> LedgerSnapshot;

    fn metrics(&self) -> LedgerMetricsSnapshot;
}

/// Build the ledger selected by `config.policy`.
pub fn build_ledger(config: &AuditConfig, reporter: FindingReporter) -> Arc<dyn AccessLedger> {
    match config.policy {
        DetectionPolicy::WriteDominance => Arc::new(WriteDominanceLedger::new(config, reporter)),
        DetectionPolicy::StrictAlternation => {
            Arc::new(StrictAlternationLedger::new(config, reporter))
        }
    }
}

// =============================================================================
// Shared Internals
// =============================================================================

/// State and collaborators common to both policies.
pub(crate) struct LedgerCore {
    pub classifier: ThreadClassifier,
    pub cells: CellArena,
    pub reporter: FindingReporter,
    pub metrics: LedgerMetrics,
    pub max_stack_depth: usize,
    pub capture_write_stacks: bool,
}

impl LedgerCore {
    pub fn new(config: &AuditConfig, reporter: FindingReporter) -> Self {
        Self {
            classifier: config.classifier(),
            cells: CellArena::new(),
            reporter,
            metrics: LedgerMetrics::default(),
            max_stack_depth: config.max_stack_depth,
            capture_write_stacks: config.capture_write_stacks,
        }
    }

    pub fn thread_name(thread: &dyn ThreadView) -> String {
        thread.name().unwrap_or(UNNAMED_THREAD).to_string()
    }

    pub fn report(&self, finding: &Finding) {
        self.metrics.record_finding();
        self.reporter.report(finding, &self.metrics);
    }

    pub fn reset(&self) {
        self.cells.clear();
        self.metrics.reset();
    }

    pub fn snapshot(&self, policy: DetectionPolicy) -> LedgerSnapshot {
        let mut keys: Vec<KeyState> = self
            .cells
            .cells()
            .into_iter()
            .map(|cell| {
                let state = cell.state();
                KeyState {
                    key: cell.key().clone(),
                    record: state.record.clone(),
                    pinned: state.pin.as_ref().map(|pin| PinnedCategory {
                        category: pin.category,
                        thread: pin.thread.clone(),
                    }),
                    flagged: cell.is_flagged(),
                }
            })
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        LedgerSnapshot { policy, keys }
    }
}
