//! Execution Events
//!
//! The run loop reports every state change as an [`ExecutionEvent`] to an
//! [`EventSink`]. Events are emitted from the run loop only, in the order
//! the changes happen, and after the matching snapshot has been published.

use std::fmt;
use std::sync::mpsc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::state::{Phase, RunStats, StepOutcome};

/// A single state change of a run.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    RunStarted {
        sequence_id: String,
        total_steps: usize,
    },
    StepStarted {
        index: usize,
        step_id: String,
    },
    /// An attempt failed and another one follows
    StepRetrying {
        index: usize,
        /// The attempt about to be made, starting at 2
        attempt: u32,
        reason: String,
    },
    StepFinished {
        index: usize,
        step_id: String,
        outcome: StepOutcome,
    },
    Paused {
        index: usize,
    },
    Resumed {
        index: usize,
    },
    RunFinished {
        phase: Phase,
        stats: RunStats,
    },
}

impl ExecutionEvent {
    /// Step index the event refers to, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            ExecutionEvent::StepStarted { index, .. }
            | ExecutionEvent::StepRetrying { index, .. }
            | ExecutionEvent::StepFinished { index, .. }
            | ExecutionEvent::Paused { index }
            | ExecutionEvent::Resumed { index } => Some(*index),
            ExecutionEvent::RunStarted { .. } | ExecutionEvent::RunFinished { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::RunFinished { .. })
    }
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionEvent::RunStarted {
                sequence_id,
                total_steps,
            } => write!(f, "run started ({} steps, sequence {})", total_steps, sequence_id),
            ExecutionEvent::StepStarted { index, step_id } => {
                write!(f, "step {} '{}' started", index + 1, step_id)
            }
            ExecutionEvent::StepRetrying {
                index,
                attempt,
                reason,
            } => write!(f, "step {} retrying (attempt {}): {}", index + 1, attempt, reason),
            ExecutionEvent::StepFinished {
                index,
                step_id,
                outcome,
            } => write!(f, "step {} '{}' {}", index + 1, step_id, outcome),
            ExecutionEvent::Paused { index } => write!(f, "paused before step {}", index + 1),
            ExecutionEvent::Resumed { index } => write!(f, "resumed at step {}", index + 1),
            ExecutionEvent::RunFinished { phase, stats } => {
                write!(f, "run finished: {} ({})", phase, stats)
            }
        }
    }
}

/// Receiver of execution events.
///
/// Sinks are passive: they must not block the run loop for long.
pub trait EventSink: Send + 'static {
    fn emit(&mut self, event: ExecutionEvent);
}

impl EventSink for UnboundedSender<ExecutionEvent> {
    fn emit(&mut self, event: ExecutionEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.send(event);
    }
}

impl EventSink for mpsc::Sender<ExecutionEvent> {
    fn emit(&mut self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSink for Box<dyn EventSink> {
    fn emit(&mut self, event: ExecutionEvent) {
        (**self).emit(event);
    }
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: ExecutionEvent) {}
}
