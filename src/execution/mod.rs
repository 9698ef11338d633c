//! Sequence Execution Module
//!
//! Provides the engine that drives a sequence through the control
//! interface, with timeout and retry policy and operator pause, resume and
//! stop.
//!
//! # Architecture
//!
//! - [`engine`]: The executor and its run loop
//! - [`step`]: Single-attempt execution of a step
//! - [`state`]: Execution state snapshots
//! - [`events`]: Progress events and sinks

pub mod engine;
pub mod events;
pub mod state;
pub mod step;


pub use engine::{ControlAction, Executor, ExecutorConfig, ExecutorError, RunReport};
pub use events::{EventSink, ExecutionEvent, NullSink};
pub use state::{
    ExecutionMode, ExecutionState, FailureKind, Phase, RunStats, StepFailure, StepOutcome,
};
