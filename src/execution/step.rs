//! Individual Step Execution
//!
//! Handles a single attempt of a step:
//! - Dispatching the typed operation to the control interface
//! - Enforcing the attempt deadline
//! - Interrupting the attempt on stop
//! - Containing panics raised by the control interface

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::control::{ControlError, ControlInterface, DelayOutcome, DiagnosticVerdict, EventWait};
use crate::sequence::operation::step_timeout;
use crate::sequence::{Operation, SchemaError, Step};

use super::state::FailureKind;

/// Why a single attempt did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// The control interface reported a failure
    Operation(String),
    /// The attempt ran past its deadline or the operation timed out
    Timeout(String),
    /// The control interface panicked or broke its contract
    Interface(String),
    /// The run was stopped while the attempt was in flight
    Cancelled,
}

impl AttemptError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AttemptError::Operation(_) => FailureKind::Operation,
            AttemptError::Timeout(_) => FailureKind::Timeout,
            AttemptError::Interface(_) => FailureKind::Interface,
            AttemptError::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Operation(message)
            | AttemptError::Timeout(message)
            | AttemptError::Interface(message) => f.write_str(message),
            AttemptError::Cancelled => f.write_str("stopped while in flight"),
        }
    }
}

/// Deadline for one attempt of `step`.
///
/// The step's own timeout wins. Otherwise operations with a bounded
/// duration get that duration plus `slack`, and the rest get no deadline.
pub fn attempt_deadline(
    step: &Step,
    operation: &Operation,
    slack: Duration,
) -> Result<Option<Duration>, SchemaError> {
    if let Some(timeout) = step_timeout(step)? {
        return Ok(Some(timeout));
    }
    Ok(operation
        .expected_duration()
        .map(|duration| duration.saturating_add(slack)))
}

/// Invokes the control interface operation matching `operation`.
pub async fn run_operation(
    control: &dyn ControlInterface,
    operation: &Operation,
    cancel: &CancellationToken,
) -> Result<(), AttemptError> {
    match operation {
        Operation::SetParameter { name, value, unit } => control
            .set_parameter(name, value, unit.as_deref(), cancel)
            .await
            .map_err(|e| control_failure(e, cancel)),

        Operation::WaitForEvent {
            event_name,
            timeout,
        } => match control.wait_for_event(event_name, *timeout, cancel).await {
            Ok(EventWait::Occurred) => Ok(()),
            Ok(EventWait::TimedOut) => Err(AttemptError::Timeout(format!(
                "event '{}' not received within {:.1}s",
                event_name,
                timeout.as_secs_f64()
            ))),
            Err(e) => Err(control_failure(e, cancel)),
        },

        Operation::Delay { duration } => match control.delay(*duration, cancel).await {
            Ok(DelayOutcome::Completed) => Ok(()),
            Ok(DelayOutcome::Cancelled) if cancel.is_cancelled() => Err(AttemptError::Cancelled),
            Ok(DelayOutcome::Cancelled) => Err(AttemptError::Interface(
                "delay reported cancellation that was never requested".to_string(),
            )),
            Err(e) => Err(control_failure(e, cancel)),
        },

        Operation::RunDiagnostic {
            diagnostic_name,
            params,
            timeout,
        } => match control
            .run_diagnostic(diagnostic_name, params, *timeout, cancel)
            .await
        {
            Ok(DiagnosticVerdict::Passed) => Ok(()),
            Ok(DiagnosticVerdict::Failed(reason)) => Err(AttemptError::Operation(format!(
                "diagnostic '{}' failed: {}",
                diagnostic_name, reason
            ))),
            Err(e) => Err(control_failure(e, cancel)),
        },

        Operation::LogMessage { message, level } => control
            .log_message(message, *level, cancel)
            .await
            .map_err(|e| control_failure(e, cancel)),
    }
}

fn control_failure(error: ControlError, cancel: &CancellationToken) -> AttemptError {
    match error {
        ControlError::Rejected(_) | ControlError::Unavailable(_) => {
            AttemptError::Operation(error.to_string())
        }
        ControlError::Cancelled if cancel.is_cancelled() => AttemptError::Cancelled,
        ControlError::Cancelled => AttemptError::Interface(
            "operation reported cancellation that was never requested".to_string(),
        ),
        ControlError::Unexpected(_) => AttemptError::Interface(error.to_string()),
    }
}

/// Runs one attempt in its own task.
///
/// The attempt gets a child of `stop`. When the deadline passes or `stop`
/// fires, the child token is cancelled and the task has `stop_grace` to
/// return before it is aborted.
pub(crate) async fn execute_attempt(
    control: Arc<dyn ControlInterface>,
    operation: Operation,
    deadline: Option<Duration>,
    stop_grace: Duration,
    stop: &CancellationToken,
) -> Result<(), AttemptError> {
    let token = stop.child_token();
    let attempt_token = token.clone();
    let mut task = tokio::spawn(async move {
        run_operation(control.as_ref(), &operation, &attempt_token).await
    });

    let timer = async {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    let interrupted = tokio::select! {
        biased;
        joined = &mut task => return joined_result(joined),
        _ = stop.cancelled() => AttemptError::Cancelled,
        _ = &mut timer => AttemptError::Timeout(format!(
            "no response within {:.1}s",
            deadline.map(|d| d.as_secs_f64()).unwrap_or_default()
        )),
    };

    debug!("Interrupting attempt: {}", interrupted);
    token.cancel();
    settle(task, stop_grace).await;
    Err(interrupted)
}

fn joined_result(joined: Result<Result<(), AttemptError>, JoinError>) -> Result<(), AttemptError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(AttemptError::Interface(format!(
            "control interface panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(_) => Err(AttemptError::Interface(
            "attempt task was cancelled unexpectedly".to_string(),
        )),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Gives a cancelled attempt `grace` to return, then aborts it.
async fn settle(mut task: JoinHandle<Result<(), AttemptError>>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        warn!(
            "Attempt ignored cancellation for {:?} - aborting it",
            grace
        );
        task.abort();
    }
}
