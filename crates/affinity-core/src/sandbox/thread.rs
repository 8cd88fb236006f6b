//! Sandbox threads and their managed call stacks.

use crate::ledger::UNNAMED_THREAD;
use crate::stack::{StackSnapshot, ThreadView};

/// One managed frame, as shown in captured stacks.
#[derive(Debug, Clone)]
struct Frame {
    owner: String,
    method: String,
    descriptor: String,
    pc: usize,
}

/// Execution state of one sandbox thread.
///
/// Captured stacks list managed frames innermost first, e.g.
/// `com/model/Model.setValue(I)V:4`.
#[derive(Debug, Clone)]
pub struct ExecThread {
    id: u64,
    name: Option<String>,
    frames: Vec<Frame>,
    steps: u64,
}

impl ExecThread {
    pub fn new(id: u64, name: Option<String>) -> Self {
        Self {
            id,
            name,
            frames: Vec::new(),
            steps: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED_THREAD)
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn push_frame(&mut self, owner: &str, method: &str, descriptor: &str) {
        self.frames.push(Frame {
            owner: owner.to_string(),
            method: method.to_string(),
            descriptor: descriptor.to_string(),
            pc: 0,
        });
    }

    pub(crate) fn pop_frame(&mut self) {
        self.frames.pop();
    }

    /// Record the pc of the innermost frame and count one step.
    pub(crate) fn step(&mut self, pc: usize) -> u64 {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = pc;
        }
        self.steps += 1;
        self.steps
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|f| format!("{}.{}{}:{}", f.owner, f.method, f.descriptor, f.pc))
            .collect()
    }
}

impl ThreadView for ExecThread {
    fn name(&self) -> Option<&str> {
        ExecThread::name(self)
    }

    fn capture_stack(&self, max_depth: usize) -> StackSnapshot {
        StackSnapshot::from_frames(self.frames(), max_depth)
    }
}
