//! Run Monitoring Module
//!
//! Provides the execution timeline recorded during a run.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, StepSpan, TimelineEvent};
