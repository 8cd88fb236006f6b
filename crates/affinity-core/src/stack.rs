//! Stack snapshots and thread views.
//!
//! The ledger never inspects threads directly. Everything it needs (a name
//! for classification and a bounded stack for diagnostics) comes through the
//! [`ThreadView`] trait, so the sandbox can hand over managed frames while
//! native callers hand over a captured backtrace.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of frames kept in a snapshot.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 10;

/// Bounded, already-rendered call stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSnapshot {
    /// Innermost frame first.
    pub frames: Vec<String>,
    /// Frames beyond the depth limit.
    pub omitted: usize,
}

impl StackSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Keep at most `max_depth` frames, counting the rest.
    pub fn from_frames<I>(frames: I, max_depth: usize) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut kept = Vec::with_capacity(max_depth.min(16));
        let mut omitted = 0;
        for frame in frames {
            if kept.len() < max_depth {
                kept.push(frame);
            } else {
                omitted += 1;
            }
        }
        Self {
            frames: kept,
            omitted,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.omitted == 0
    }

    pub fn depth(&self) -> usize {
        self.frames.len() + self.omitted
    }
}

impl fmt::Display for StackSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "    at {}", frame)?;
        }
        if self.omitted > 0 {
            if !self.frames.is_empty() {
                writeln!(f)?;
            }
            write!(f, "    ... {} more", self.omitted)?;
        }
        Ok(())
    }
}

/// What the ledger may know about the thread performing an access.
pub trait ThreadView {
    /// Thread name, if the thread has one.
    fn name(&self) -> Option<&str>;

    /// Capture the current call stack, bounded by `max_depth`.
    fn capture_stack(&self, max_depth: usize) -> StackSnapshot;
}

/// [`ThreadView`] over the calling OS thread, using `std::backtrace`.
#[derive(Debug, Clone)]
pub struct NativeThread {
    name: Option<String>,
}

impl NativeThread {
    pub fn current() -> Self {
        Self {
            name: std::thread::current().name().map(str::to_string),
        }
    }

    /// A view with an explicit name, for callers that track names themselves.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl ThreadView for NativeThread {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn capture_stack(&self, max_depth: usize) -> StackSnapshot {
        let rendered = std::backtrace::Backtrace::force_capture().to_string();
        StackSnapshot::from_frames(backtrace_frames(&rendered), max_depth)
    }
}

/// Extract symbol lines (`  12: crate::module::function`) from a rendered
/// backtrace, dropping the capture machinery itself.
fn backtrace_frames(rendered: &str) -> impl Iterator<Item = String> + '_ {
    rendered
        .lines()
        .filter_map(|line| {
            let (index, symbol) = line.trim_start().split_once(": ")?;
            index.parse::<usize>().ok()?;
            Some(symbol.trim())
        })
        .skip_while(|symbol| {
            symbol.starts_with("std::backtrace")
                || symbol.contains("NativeThread")
                || symbol.contains("capture_stack")
        })
        .map(str::to_string)
}
