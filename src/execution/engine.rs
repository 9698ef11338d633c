//! Sequence Execution Engine
//!
//! The core engine that drives a sequence through the control interface:
//! - Strictly sequential step execution on a dedicated tokio task
//! - Per-attempt deadlines and retry policy
//! - Pause/resume at step boundaries and prompt, cooperative stop
//! - Snapshots through a watch channel and events through an [`EventSink`]
//!
//! All mutation of [`ExecutionState`] happens inside the run loop. The
//! [`Executor`] handle only reads snapshots and raises requests.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::control::ControlInterface;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::sequence::operation::{DEFAULT_DIAGNOSTIC_TIMEOUT, DEFAULT_EVENT_TIMEOUT};
use crate::sequence::{resolve, FailurePolicy, Sequence, Step, TimeoutDefaults};

use super::events::{EventSink, ExecutionEvent};
use super::state::{ExecutionMode, ExecutionState, FailureKind, Phase, StepFailure, StepOutcome};
use super::step::{attempt_deadline, execute_attempt, AttemptError};

/// Executor tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Time an interrupted attempt gets to return before it is aborted
    pub stop_grace_ms: u64,

    /// Wait between a failed attempt and the next one
    pub retry_backoff_ms: u64,

    /// Added to an operation's own duration to form its deadline
    pub deadline_slack_ms: u64,

    /// Event wait used when neither the step nor its parameters set one
    pub default_event_timeout_secs: f64,

    /// Diagnostic budget used when the step sets no timeout
    pub default_diagnostic_timeout_secs: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: 250,
            retry_backoff_ms: 0,
            deadline_slack_ms: 1000,
            default_event_timeout_secs: DEFAULT_EVENT_TIMEOUT.as_secs_f64(),
            default_diagnostic_timeout_secs: DEFAULT_DIAGNOSTIC_TIMEOUT.as_secs_f64(),
        }
    }
}

impl ExecutorConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn deadline_slack(&self) -> Duration {
        Duration::from_millis(self.deadline_slack_ms)
    }

    /// Timeout defaults for resolving steps. Non-positive values fall back
    /// to the built-in defaults.
    pub fn timeout_defaults(&self) -> TimeoutDefaults {
        TimeoutDefaults {
            event: positive_secs(self.default_event_timeout_secs).unwrap_or(DEFAULT_EVENT_TIMEOUT),
            diagnostic: positive_secs(self.default_diagnostic_timeout_secs)
                .unwrap_or(DEFAULT_DIAGNOSTIC_TIMEOUT),
        }
    }
}

fn positive_secs(seconds: f64) -> Option<Duration> {
    if seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        warn!("Ignoring non-positive timeout default: {}", seconds);
        None
    }
}

/// Operator requests that act on a running sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Stop => "stop",
        })
    }
}

/// Misuse of the executor's control protocol.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("a run is already active")]
    AlreadyActive,

    #[error("the executor must be started from within a tokio runtime")]
    NoRuntime,

    #[error("cannot {action} while the run is {phase}")]
    NotApplicable { action: ControlAction, phase: Phase },

    #[error("{0} has already been requested")]
    AlreadyRequested(ControlAction),

    #[error("no run has been started")]
    NotStarted,

    #[error("run task failed: {0}")]
    TaskFailed(String),
}

/// Final state and timing of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: ExecutionState,
    pub timeline: ExecutionTimeline,
}

type SharedSink = Arc<Mutex<Box<dyn EventSink>>>;

struct RunControls {
    hold: Arc<watch::Sender<bool>>,
    stop: CancellationToken,
}

/// Sequence executor.
///
/// Drives one run at a time. Create it once with the control interface and
/// an event sink, then `start` as many runs as needed.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sequencer::control::SimulatedControl;
/// use sequencer::execution::{ExecutionMode, Executor};
/// use sequencer::sequence::Sequence;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
///     let mut executor = Executor::new(Arc::new(SimulatedControl::default()), tx);
///
///     executor.start(&Sequence::example(), ExecutionMode::Normal)?;
///     while let Some(event) = rx.recv().await {
///         println!("{}", event);
///         if event.is_terminal() {
///             break;
///         }
///     }
///
///     let report = executor.wait().await?;
///     println!("{}", report.state.stats);
///     Ok(())
/// }
/// ```
pub struct Executor {
    control: Arc<dyn ControlInterface>,
    config: ExecutorConfig,
    sink: SharedSink,
    snapshot: watch::Receiver<ExecutionState>,
    controls: Option<RunControls>,
    task: Option<JoinHandle<RunReport>>,
}

impl Executor {
    /// Creates an idle executor.
    pub fn new(control: Arc<dyn ControlInterface>, sink: impl EventSink) -> Self {
        let (_, snapshot) = watch::channel(ExecutionState::idle());
        let sink: Box<dyn EventSink> = Box::new(sink);
        Self {
            control,
            config: ExecutorConfig::default(),
            sink: Arc::new(Mutex::new(sink)),
            snapshot,
            controls: None,
            task: None,
        }
    }

    /// Replaces the configuration used by subsequent runs.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_config(&mut self, config: ExecutorConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Starts a run over a snapshot of `sequence`.
    ///
    /// Later edits to `sequence` do not affect the run. Fails while the
    /// previous run is Running or Paused. A previous run that has already
    /// published its final phase is detached along with its report.
    pub fn start(&mut self, sequence: &Sequence, mode: ExecutionMode) -> Result<(), ExecutorError> {
        let runtime = Handle::try_current().map_err(|_| ExecutorError::NoRuntime)?;

        if let Some(task) = &self.task {
            // A loop that died before publishing a final phase cannot block restarts.
            if !task.is_finished() && self.snapshot.borrow().phase.is_active() {
                return Err(ExecutorError::AlreadyActive);
            }
        }

        let sequence = sequence.clone();
        let state = ExecutionState::begin(&sequence, mode);
        let (publisher, snapshot) = watch::channel(state.clone());
        let (hold, _) = watch::channel(false);
        let hold = Arc::new(hold);
        let stop = CancellationToken::new();

        info!(
            "Starting sequence '{}' ({} steps, mode: {})",
            sequence.metadata.name,
            sequence.len(),
            mode
        );

        let run = RunLoop {
            defaults: self.config.timeout_defaults(),
            config: self.config.clone(),
            control: Arc::clone(&self.control),
            sink: Arc::clone(&self.sink),
            sequence,
            mode,
            state,
            publisher,
            hold: Arc::clone(&hold),
            stop: stop.clone(),
            timeline: ExecutionTimeline::new(),
        };

        self.task = Some(runtime.spawn(run.run()));
        self.snapshot = snapshot;
        self.controls = Some(RunControls { hold, stop });
        Ok(())
    }

    /// Requests a pause at the next step boundary.
    pub fn pause(&self) -> Result<(), ExecutorError> {
        let snapshot = self.snapshot.borrow();
        let controls = self.require_phase(ControlAction::Pause, snapshot.phase, &[Phase::Running])?;
        if *controls.hold.borrow() {
            return Err(ExecutorError::AlreadyRequested(ControlAction::Pause));
        }
        controls.hold.send_replace(true);
        info!("Pause requested");
        Ok(())
    }

    /// Lets a paused run continue.
    pub fn resume(&self) -> Result<(), ExecutorError> {
        let snapshot = self.snapshot.borrow();
        let controls = self.require_phase(ControlAction::Resume, snapshot.phase, &[Phase::Paused])?;
        if !*controls.hold.borrow() {
            return Err(ExecutorError::AlreadyRequested(ControlAction::Resume));
        }
        controls.hold.send_replace(false);
        info!("Resume requested");
        Ok(())
    }

    /// Stops the run, interrupting any in-flight step.
    pub fn stop(&self) -> Result<(), ExecutorError> {
        // Holding the snapshot keeps the run loop from publishing its final
        // phase until the request is in place.
        let snapshot = self.snapshot.borrow();
        let controls = self.require_phase(
            ControlAction::Stop,
            snapshot.phase,
            &[Phase::Running, Phase::Paused],
        )?;
        if controls.stop.is_cancelled() {
            return Err(ExecutorError::AlreadyRequested(ControlAction::Stop));
        }
        controls.stop.cancel();
        info!("Stop requested");
        Ok(())
    }

    fn require_phase(
        &self,
        action: ControlAction,
        phase: Phase,
        allowed: &[Phase],
    ) -> Result<&RunControls, ExecutorError> {
        match &self.controls {
            Some(controls) if allowed.contains(&phase) => Ok(controls),
            _ => Err(ExecutorError::NotApplicable { action, phase }),
        }
    }

    /// Immutable copy of the latest published state.
    pub fn current_state(&self) -> ExecutionState {
        self.snapshot.borrow().clone()
    }

    /// Phase of the latest published state.
    pub fn phase(&self) -> Phase {
        self.snapshot.borrow().phase
    }

    /// Receiver for the current run's snapshots.
    ///
    /// A receiver obtained before `start` keeps observing the earlier run.
    pub fn watch_state(&self) -> watch::Receiver<ExecutionState> {
        self.snapshot.clone()
    }

    /// Waits for the current run to finish.
    ///
    /// Cancel safe: if the returned future is dropped, the run stays tracked
    /// and can be waited on, stopped or dropped later.
    pub async fn wait(&mut self) -> Result<RunReport, ExecutorError> {
        let task = self.task.as_mut().ok_or(ExecutorError::NotStarted)?;
        let joined = task.await;
        self.task = None;
        joined.map_err(|e| ExecutorError::TaskFailed(e.to_string()))
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Some(controls) = &self.controls {
            controls.stop.cancel();
        }
    }
}

/// The run loop. Owns the execution state for the duration of one run.
struct RunLoop {
    sequence: Sequence,
    mode: ExecutionMode,
    control: Arc<dyn ControlInterface>,
    config: ExecutorConfig,
    defaults: TimeoutDefaults,
    sink: SharedSink,
    state: ExecutionState,
    publisher: watch::Sender<ExecutionState>,
    hold: Arc<watch::Sender<bool>>,
    stop: CancellationToken,
    timeline: ExecutionTimeline,
}

impl RunLoop {
    async fn run(mut self) -> RunReport {
        self.publish();
        self.emit(ExecutionEvent::RunStarted {
            sequence_id: self.sequence.id.clone(),
            total_steps: self.sequence.len(),
        });

        let phase = self.drive().await;
        self.finish(phase);

        RunReport {
            state: self.state,
            timeline: self.timeline,
        }
    }

    async fn drive(&mut self) -> Phase {
        let total = self.sequence.len();

        for index in 0..total {
            self.state.current_index = Some(index);

            if self.stop.is_cancelled() {
                return self.stop_at(index);
            }
            if !self.hold_point(index).await {
                return self.stop_at(index);
            }

            let step = self.sequence.steps[index].clone();

            if !step.enabled {
                debug!("Step '{}' is disabled - skipping", step.id);
                self.timeline.add_event(&step.id, EventType::Skipped);
                self.settle_step(index, &step.id, StepOutcome::Skipped);
                continue;
            }

            info!("Starting step {}/{}: {} ({})", index + 1, total, step.id, step.kind);
            self.state.set_outcome(index, StepOutcome::Running);
            self.publish();
            self.emit(ExecutionEvent::StepStarted {
                index,
                step_id: step.id.clone(),
            });
            self.timeline.add_event(&step.id, EventType::Started);

            match self.execute_with_retries(index, &step).await {
                Ok(()) => {
                    info!("Step '{}' completed", step.id);
                    self.timeline.add_event(&step.id, EventType::Completed);
                    self.settle_step(index, &step.id, StepOutcome::Succeeded);

                    if self.mode == ExecutionMode::StepByStep && index + 1 < total {
                        self.hold.send_replace(true);
                    }
                }
                Err(failure) if failure.kind == FailureKind::Cancelled => {
                    warn!("Step '{}' interrupted by stop", step.id);
                    self.timeline.add_event(&step.id, EventType::Failed);
                    self.settle_step(index, &step.id, StepOutcome::Failed(failure));
                    return self.stop_at(index + 1);
                }
                Err(failure) => {
                    error!("Step '{}' failed: {}", step.id, failure);
                    self.timeline.add_event(&step.id, EventType::Failed);
                    self.settle_step(index, &step.id, StepOutcome::Failed(failure));

                    if self.sequence.failure_policy == FailurePolicy::Abort {
                        info!("Aborting run - remaining steps skipped");
                        self.state.skip_from(index + 1);
                        return Phase::Failed;
                    }
                }
            }
        }

        if self.stop.is_cancelled() {
            return self.stop_at(total);
        }
        if self.state.stats.failed > 0 {
            Phase::Failed
        } else {
            Phase::Completed
        }
    }

    /// Suspends while a pause is held. Returns `false` if stopped meanwhile.
    async fn hold_point(&mut self, index: usize) -> bool {
        if !*self.hold.borrow() {
            return true;
        }

        info!("Paused before step {}", index + 1);
        self.state.phase = Phase::Paused;
        self.publish();
        self.emit(ExecutionEvent::Paused { index });

        let mut released = self.hold.subscribe();
        let resumed = tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            ok = until_released(&mut released) => ok,
        };
        if !resumed {
            return false;
        }

        info!("Resumed at step {}", index + 1);
        self.state.phase = Phase::Running;
        self.publish();
        self.emit(ExecutionEvent::Resumed { index });
        true
    }

    async fn execute_with_retries(&mut self, index: usize, step: &Step) -> Result<(), StepFailure> {
        let schema_failure = |e: crate::sequence::SchemaError| StepFailure {
            kind: FailureKind::Schema,
            message: e.to_string(),
            attempts: 0,
        };

        let operation =
            resolve(step, &self.sequence.variables, &self.defaults).map_err(schema_failure)?;
        let deadline =
            attempt_deadline(step, &operation, self.config.deadline_slack()).map_err(schema_failure)?;

        if self.mode == ExecutionMode::DryRun {
            info!("[dry-run] {}: {}", step.id, operation);
            return Ok(());
        }

        let max_attempts = step.max_attempts();
        let mut attempt = 0;

        loop {
            if self.stop.is_cancelled() {
                return Err(cancelled(attempt));
            }

            attempt += 1;
            self.state.set_attempts(index, attempt);
            debug!("Step '{}' attempt {}/{}: {}", step.id, attempt, max_attempts, operation);

            let result = execute_attempt(
                Arc::clone(&self.control),
                operation.clone(),
                deadline,
                self.config.stop_grace(),
                &self.stop,
            )
            .await;

            let failure = match result {
                Ok(()) => return Ok(()),
                Err(AttemptError::Cancelled) => return Err(cancelled(attempt)),
                Err(failure) => failure,
            };

            if attempt >= max_attempts {
                return Err(StepFailure {
                    kind: failure.kind(),
                    message: failure.to_string(),
                    attempts: attempt,
                });
            }

            warn!(
                "Step '{}' attempt {}/{} failed: {}",
                step.id, attempt, max_attempts, failure
            );

            let backoff = self.config.retry_backoff();
            if !backoff.is_zero() {
                tokio::select! {
                    _ = self.stop.cancelled() => return Err(cancelled(attempt)),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            self.publish();
            self.emit(ExecutionEvent::StepRetrying {
                index,
                attempt: attempt + 1,
                reason: failure.to_string(),
            });
        }
    }

    fn settle_step(&mut self, index: usize, step_id: &str, outcome: StepOutcome) {
        self.state.set_outcome(index, outcome.clone());
        self.publish();
        self.emit(ExecutionEvent::StepFinished {
            index,
            step_id: step_id.to_string(),
            outcome,
        });
    }

    fn stop_at(&mut self, index: usize) -> Phase {
        info!("Run stopped - skipping steps from {}", index + 1);
        self.state.skip_from(index);
        Phase::Stopped
    }

    fn finish(&mut self, phase: Phase) {
        let stop = &self.stop;
        let state = &mut self.state;

        // Held until RunFinished is out, so a run started as soon as the final
        // phase is visible cannot emit ahead of it.
        let mut sink = self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // A stop accepted before this point wins over the computed phase.
        self.publisher.send_modify(|snapshot| {
            let phase = if stop.is_cancelled() && phase != Phase::Stopped {
                state.skip_from(0);
                Phase::Stopped
            } else {
                phase
            };
            state.finish(phase);
            *snapshot = state.clone();
        });

        info!(
            "Sequence '{}' finished: {} ({})",
            self.sequence.metadata.name, self.state.phase, self.state.stats
        );
        let event = ExecutionEvent::RunFinished {
            phase: self.state.phase,
            stats: self.state.stats,
        };
        debug!("Event: {}", event);
        sink.emit(event);
    }

    fn publish(&self) {
        self.publisher.send_replace(self.state.clone());
    }

    fn emit(&self, event: ExecutionEvent) {
        debug!("Event: {}", event);
        let mut sink = self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sink.emit(event);
    }
}

fn cancelled(attempts: u32) -> StepFailure {
    StepFailure {
        kind: FailureKind::Cancelled,
        message: AttemptError::Cancelled.to_string(),
        attempts,
    }
}

async fn until_released(hold: &mut watch::Receiver<bool>) -> bool {
    hold.wait_for(|held| !*held).await.is_ok()
}
