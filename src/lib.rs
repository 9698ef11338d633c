//! Sequencer - Control Sequence Execution Engine
//!
//! An operator-facing engine for composing ordered sequences of control
//! operations (set a parameter, wait for an event, delay, run a diagnostic,
//! log a message) and executing them against a control system with
//! per-step timeouts, retries and operator pause, resume and stop.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`sequence`]: Data structures, validation and parsing for sequences
//! - [`control`]: The control interface the engine drives, plus a simulation
//! - [`execution`]: Core execution engine with the run loop and state snapshots
//! - [`monitoring`]: Execution timeline for run reports
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sequencer::control::SimulatedControl;
//! use sequencer::execution::{ExecutionMode, NullSink};
//! use sequencer::{load_sequence, Executor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a sequence from YAML
//!     let sequence = load_sequence("beam_setup.yaml")?;
//!
//!     // Create the executor against a simulated control system
//!     let mut executor = Executor::new(Arc::new(SimulatedControl::default()), NullSink);
//!
//!     // Execute the sequence
//!     executor.start(&sequence, ExecutionMode::Normal)?;
//!     let report = executor.wait().await?;
//!     println!("{}: {}", report.state.phase, report.state.stats);
//!     Ok(())
//! }
//! ```

pub mod control;
pub mod execution;
pub mod monitoring;
pub mod sequence;

// Re-export commonly used types
pub use control::ControlInterface;
pub use execution::{ExecutionMode, ExecutionState, Executor, Phase};
pub use sequence::{load_sequence, save_sequence, Sequence, Step, StepKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Sequencer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Sequencer");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::delay(1.5).with_id("settle");
        assert_eq!(step.id, "settle");
        assert_eq!(step.kind, StepKind::Delay);
    }

    #[test]
    fn test_module_exports_sequence() {
        let sequence = Sequence::new("empty");
        assert!(sequence.is_empty());
        assert_eq!(ExecutionState::idle().phase, Phase::Idle);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
