//! Control Interface Module
//!
//! The boundary through which steps produce effects on the controlled
//! system. The executor only ever talks to a [`ControlInterface`]; what sits
//! behind it (hardware, a simulation, a test script) is supplied by the
//! caller.
//!
//! # Components
//!
//! - [`ControlInterface`]: One async operation per step kind
//! - [`SimulatedControl`]: Deterministic simulation of an accelerator control system
//! - [`ScriptedControl`]: Scripted double that records every invocation

pub mod scripted;
pub mod simulated;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::sequence::{LogLevel, Parameters};

pub use scripted::{Invocation, Reply, ScriptedControl};
pub use simulated::{SimulatedControl, SimulationConfig};

/// Failure reported by a control interface operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("control system unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unexpected control failure: {0}")]
    Unexpected(String),
}

/// Result of waiting for an external event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventWait {
    Occurred,
    TimedOut,
}

/// Result of a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    Completed,
    Cancelled,
}

/// Verdict of a diagnostic run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticVerdict {
    Passed,
    Failed(String),
}

/// Operations exposed by the controlled system, one per step kind.
///
/// Every blocking operation must return promptly once `cancel` fires.
/// Operations are not assumed idempotent; retrying is the caller's job.
/// The executor never issues two calls at the same time.
#[async_trait]
pub trait ControlInterface: Send + Sync {
    async fn set_parameter(
        &self,
        name: &str,
        value: &Value,
        unit: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), ControlError>;

    async fn wait_for_event(
        &self,
        event_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EventWait, ControlError>;

    async fn delay(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<DelayOutcome, ControlError>;

    async fn run_diagnostic(
        &self,
        diagnostic_name: &str,
        params: &Parameters,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DiagnosticVerdict, ControlError>;

    async fn log_message(
        &self,
        text: &str,
        level: LogLevel,
        cancel: &CancellationToken,
    ) -> Result<(), ControlError>;
}

/// Sleeps for `duration` unless `cancel` fires first.
///
/// Returns `false` when the sleep was cut short.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
