//! Scripted Control Double
//!
//! A [`ControlInterface`] whose answers are queued up front. Each step kind
//! has its own FIFO of [`Reply`] values; an empty queue falls back to the
//! kind's standing reply, or to [`Reply::Succeed`]. Every call is recorded
//! so tests can assert how often the executor reached the interface.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{sleep_or_cancel, ControlError, ControlInterface, DelayOutcome, DiagnosticVerdict, EventWait};
use crate::sequence::{LogLevel, Parameters, StepKind};

/// How the double answers one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Succeed immediately
    Succeed,
    /// Report an operation failure with this message
    Fail(String),
    /// `WaitForEvent` reports a timeout; other kinds block until cancelled
    TimedOut,
    /// Block until cancelled
    Hang,
    /// Panic inside the call
    Panic,
    /// Succeed after the given time, unless cancelled first
    After(Duration),
    /// Sleep for the given time ignoring cancellation, then succeed
    Unresponsive(Duration),
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub kind: StepKind,
    /// Parameter name, event name, diagnostic name, log text or delay length
    pub target: String,
    pub at: Instant,
}

enum Played {
    Done,
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Control interface double driven by scripted replies.
///
/// # Example
///
/// ```
/// use sequencer::control::{Reply, ScriptedControl};
/// use sequencer::sequence::StepKind;
///
/// let control = ScriptedControl::new()
///     .with_replies(StepKind::SetParameter, [Reply::Fail("rejected".into()), Reply::Succeed]);
/// assert_eq!(control.calls(StepKind::SetParameter), 0);
/// ```
#[derive(Default)]
pub struct ScriptedControl {
    queues: Mutex<HashMap<StepKind, VecDeque<Reply>>>,
    standing: Mutex<HashMap<StepKind, Reply>>,
    invocations: Mutex<Vec<Invocation>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues replies for a kind.
    pub fn with_replies(self, kind: StepKind, replies: impl IntoIterator<Item = Reply>) -> Self {
        lock(&self.queues).entry(kind).or_default().extend(replies);
        self
    }

    /// Sets the reply used once the kind's queue is empty.
    pub fn always(self, kind: StepKind, reply: Reply) -> Self {
        lock(&self.standing).insert(kind, reply);
        self
    }

    /// Queues one more reply.
    pub fn push_reply(&self, kind: StepKind, reply: Reply) {
        lock(&self.queues).entry(kind).or_default().push_back(reply);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Number of calls made for one kind.
    pub fn calls(&self, kind: StepKind) -> usize {
        lock(&self.invocations)
            .iter()
            .filter(|call| call.kind == kind)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.invocations).len()
    }

    fn next_reply(&self, kind: StepKind, target: String) -> Reply {
        lock(&self.invocations).push(Invocation {
            kind,
            target,
            at: Instant::now(),
        });

        let queued = lock(&self.queues)
            .get_mut(&kind)
            .and_then(|queue| queue.pop_front());

        queued
            .or_else(|| lock(&self.standing).get(&kind).cloned())
            .unwrap_or(Reply::Succeed)
    }

    async fn play(&self, kind: StepKind, target: String, cancel: &CancellationToken) -> Played {
        match self.next_reply(kind, target.clone()) {
            Reply::Succeed => Played::Done,
            Reply::Fail(message) => Played::Failed(message),
            Reply::TimedOut if kind == StepKind::WaitForEvent => Played::TimedOut,
            Reply::TimedOut | Reply::Hang => {
                cancel.cancelled().await;
                Played::Cancelled
            }
            Reply::Panic => panic!("scripted panic during {} '{}'", kind, target),
            Reply::After(duration) => {
                if sleep_or_cancel(duration, cancel).await {
                    Played::Done
                } else {
                    Played::Cancelled
                }
            }
            Reply::Unresponsive(duration) => {
                tokio::time::sleep(duration).await;
                Played::Done
            }
        }
    }
}

#[async_trait]
impl ControlInterface for ScriptedControl {
    async fn set_parameter(
        &self,
        name: &str,
        _value: &Value,
        _unit: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), ControlError> {
        match self.play(StepKind::SetParameter, name.to_string(), cancel).await {
            Played::Done | Played::TimedOut => Ok(()),
            Played::Failed(message) => Err(ControlError::Rejected(message)),
            Played::Cancelled => Err(ControlError::Cancelled),
        }
    }

    async fn wait_for_event(
        &self,
        event_name: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EventWait, ControlError> {
        match self.play(StepKind::WaitForEvent, event_name.to_string(), cancel).await {
            Played::Done => Ok(EventWait::Occurred),
            Played::TimedOut => Ok(EventWait::TimedOut),
            Played::Failed(message) => Err(ControlError::Unavailable(message)),
            Played::Cancelled => Err(ControlError::Cancelled),
        }
    }

    async fn delay(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<DelayOutcome, ControlError> {
        let target = format!("{:?}", duration);
        match self.play(StepKind::Delay, target, cancel).await {
            Played::Done | Played::TimedOut => Ok(DelayOutcome::Completed),
            Played::Failed(message) => Err(ControlError::Unexpected(message)),
            Played::Cancelled => Ok(DelayOutcome::Cancelled),
        }
    }

    async fn run_diagnostic(
        &self,
        diagnostic_name: &str,
        _params: &Parameters,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DiagnosticVerdict, ControlError> {
        match self
            .play(StepKind::RunDiagnostic, diagnostic_name.to_string(), cancel)
            .await
        {
            Played::Done | Played::TimedOut => Ok(DiagnosticVerdict::Passed),
            Played::Failed(message) => Ok(DiagnosticVerdict::Failed(message)),
            Played::Cancelled => Err(ControlError::Cancelled),
        }
    }

    async fn log_message(
        &self,
        text: &str,
        _level: LogLevel,
        cancel: &CancellationToken,
    ) -> Result<(), ControlError> {
        match self.play(StepKind::LogMessage, text.to_string(), cancel).await {
            Played::Done | Played::TimedOut => Ok(()),
            Played::Failed(message) => Err(ControlError::Unexpected(message)),
            Played::Cancelled => Err(ControlError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_then_fallback() {
        let control = ScriptedControl::new()
            .with_replies(StepKind::SetParameter, [Reply::Fail("no".into())]);
        let token = CancellationToken::new();
        let value = Value::from(1);

        let first = control.set_parameter("A", &value, None, &token).await;
        assert_eq!(first, Err(ControlError::Rejected("no".into())));

        let second = control.set_parameter("A", &value, None, &token).await;
        assert_eq!(second, Ok(()));
        assert_eq!(control.calls(StepKind::SetParameter), 2);
    }

    #[tokio::test]
    async fn test_standing_reply() {
        let control = ScriptedControl::new().always(StepKind::RunDiagnostic, Reply::Fail("bad".into()));
        let token = CancellationToken::new();

        for _ in 0..3 {
            let verdict = control
                .run_diagnostic("Check", &Parameters::new(), Duration::from_secs(1), &token)
                .await;
            assert_eq!(verdict, Ok(DiagnosticVerdict::Failed("bad".into())));
        }
        assert_eq!(control.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_event_timed_out() {
        let control = ScriptedControl::new().with_replies(StepKind::WaitForEvent, [Reply::TimedOut]);
        let token = CancellationToken::new();
        let result = control
            .wait_for_event("Beam_Ready_Signal", Duration::from_secs(1), &token)
            .await;
        assert_eq!(result, Ok(EventWait::TimedOut));
        assert_eq!(control.invocations()[0].target, "Beam_Ready_Signal");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_returns_on_cancel() {
        let control = ScriptedControl::new().with_replies(StepKind::Delay, [Reply::Hang]);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = control.delay(Duration::from_secs(100), &token).await;
        assert_eq!(result, Ok(DelayOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_waits() {
        let control = ScriptedControl::new()
            .with_replies(StepKind::LogMessage, [Reply::After(Duration::from_secs(2))]);
        let token = CancellationToken::new();
        let start = Instant::now();

        control.log_message("hi", LogLevel::Info, &token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
