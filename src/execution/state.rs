//! Execution State
//!
//! The record of a single run's progress. One instance exists per run; it
//! is created by `start`, mutated only by the run loop and handed to
//! everyone else as an immutable snapshot.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sequence::Sequence;

/// Top-level state of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl Phase {
    /// Completed, Failed and Stopped are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Stopped)
    }

    /// Running or Paused.
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Running | Phase::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Running => "Running",
            Phase::Paused => "Paused",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the run loop treats step boundaries and the control interface.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Steps run back to back
    #[default]
    Normal,
    /// The run pauses after every successful step
    StepByStep,
    /// Steps are resolved but the control interface is never called
    DryRun,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Normal => "normal",
            ExecutionMode::StepByStep => "step-by-step",
            ExecutionMode::DryRun => "dry-run",
        })
    }
}

/// Why a step failed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Parameters do not satisfy the kind's schema
    Schema,
    /// The control interface reported a failure
    Operation,
    /// The attempt did not finish before its deadline
    Timeout,
    /// The control interface misbehaved (panicked or broke its contract)
    Interface,
    /// The run was stopped while the step was in flight
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Schema => "schema error",
            FailureKind::Operation => "operation failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Interface => "interface error",
            FailureKind::Cancelled => "cancelled",
        })
    }
}

/// Details of a failed step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Attempts made before giving up
    pub attempts: u32,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (after {} attempt{})",
            self.kind,
            self.message,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" }
        )
    }
}

/// Per-step result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub enum StepOutcome {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed(StepFailure),
    Skipped,
}

impl StepOutcome {
    /// Succeeded, Failed or Skipped.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            StepOutcome::Succeeded | StepOutcome::Failed(_) | StepOutcome::Skipped
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Pending => "Pending",
            StepOutcome::Running => "Running",
            StepOutcome::Succeeded => "Succeeded",
            StepOutcome::Failed(_) => "Failed",
            StepOutcome::Skipped => "Skipped",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Failed(failure) => write!(f, "Failed ({})", failure),
            other => f.write_str(other.label()),
        }
    }
}

/// Step counts derived from the outcomes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunStats {
    pub fn from_outcomes(outcomes: &[StepOutcome]) -> Self {
        let mut stats = RunStats {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                StepOutcome::Succeeded => stats.succeeded += 1,
                StepOutcome::Failed(_) => stats.failed += 1,
                StepOutcome::Skipped => stats.skipped += 1,
                StepOutcome::Pending | StepOutcome::Running => {}
            }
        }
        stats
    }

    /// Steps not yet settled.
    pub fn remaining(&self) -> usize {
        self.total - self.succeeded - self.failed - self.skipped
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} succeeded, {} failed, {} skipped",
            self.total, self.succeeded, self.failed, self.skipped
        )
    }
}

/// Snapshot of a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ExecutionState {
    pub phase: Phase,
    pub mode: ExecutionMode,
    pub sequence_id: String,
    pub sequence_name: String,

    /// Step executing or about to execute; `None` while idle
    pub current_index: Option<usize>,

    /// One outcome per step, in sequence order
    pub outcomes: Vec<StepOutcome>,

    /// Control interface attempts made per step
    pub attempts: Vec<u32>,

    pub stats: RunStats,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    /// State before any run has started.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Fresh state for a run that is about to begin.
    pub(crate) fn begin(sequence: &Sequence, mode: ExecutionMode) -> Self {
        let count = sequence.steps.len();
        let outcomes = vec![StepOutcome::Pending; count];
        Self {
            phase: Phase::Running,
            mode,
            sequence_id: sequence.id.clone(),
            sequence_name: sequence.metadata.name.clone(),
            current_index: if count == 0 { None } else { Some(0) },
            stats: RunStats::from_outcomes(&outcomes),
            outcomes,
            attempts: vec![0; count],
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    pub fn outcome(&self, index: usize) -> Option<&StepOutcome> {
        self.outcomes.get(index)
    }

    pub(crate) fn set_outcome(&mut self, index: usize, outcome: StepOutcome) {
        if let Some(slot) = self.outcomes.get_mut(index) {
            *slot = outcome;
            self.stats = RunStats::from_outcomes(&self.outcomes);
        }
    }

    pub(crate) fn set_attempts(&mut self, index: usize, attempts: u32) {
        if let Some(slot) = self.attempts.get_mut(index) {
            *slot = attempts;
        }
    }

    /// Marks every step from `index` on that has not settled as Skipped.
    pub(crate) fn skip_from(&mut self, index: usize) {
        for outcome in self.outcomes.iter_mut().skip(index) {
            if !outcome.is_settled() {
                *outcome = StepOutcome::Skipped;
            }
        }
        self.stats = RunStats::from_outcomes(&self.outcomes);
    }

    pub(crate) fn finish(&mut self, phase: Phase) {
        self.phase = phase;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Percentage of steps that have settled.
    pub fn progress_percent(&self) -> f64 {
        if self.stats.total == 0 {
            return if self.phase.is_terminal() { 100.0 } else { 0.0 };
        }
        let settled = self.stats.total - self.stats.remaining();
        settled as f64 * 100.0 / self.stats.total as f64
    }

    /// Wall-clock duration of the run so far, or in total once finished.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.finished_at.unwrap_or_else(Utc::now) - started)
    }

    /// True when the stats match the outcomes and a terminal run has no
    /// unsettled step.
    pub fn is_consistent(&self) -> bool {
        if self.stats != RunStats::from_outcomes(&self.outcomes) {
            return false;
        }
        !self.phase.is_terminal() || self.outcomes.iter().all(StepOutcome::is_settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Step;

    fn three_steps() -> Sequence {
        Sequence::from_steps(
            "test",
            vec![Step::delay(1.0), Step::delay(1.0), Step::delay(1.0)],
        )
    }

    #[test]
    fn test_begin_resets_everything() {
        let state = ExecutionState::begin(&three_steps(), ExecutionMode::Normal);
        assert_eq!(state.phase, Phase::Running);
        assert_eq!(state.current_index, Some(0));
        assert_eq!(state.outcomes, vec![StepOutcome::Pending; 3]);
        assert_eq!(state.stats.total, 3);
        assert_eq!(state.stats.remaining(), 3);
        assert!(state.started_at.is_some());
        assert!(state.finished_at.is_none());
    }

    #[test]
    fn test_idle_state() {
        let state = ExecutionState::idle();
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.current_index, None);
        assert!(state.outcomes.is_empty());
    }

    #[test]
    fn test_stats_follow_outcomes() {
        let mut state = ExecutionState::begin(&three_steps(), ExecutionMode::Normal);
        state.set_outcome(0, StepOutcome::Succeeded);
        state.set_outcome(
            1,
            StepOutcome::Failed(StepFailure {
                kind: FailureKind::Operation,
                message: "rejected".into(),
                attempts: 2,
            }),
        );
        state.skip_from(2);

        assert_eq!(
            state.stats,
            RunStats {
                total: 3,
                succeeded: 1,
                failed: 1,
                skipped: 1
            }
        );
        state.finish(Phase::Failed);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_skip_from_keeps_settled() {
        let mut state = ExecutionState::begin(&three_steps(), ExecutionMode::Normal);
        state.set_outcome(2, StepOutcome::Succeeded);
        state.skip_from(0);
        assert_eq!(
            state.outcomes,
            vec![StepOutcome::Skipped, StepOutcome::Skipped, StepOutcome::Succeeded]
        );
    }

    #[test]
    fn test_terminal_with_pending_is_inconsistent() {
        let mut state = ExecutionState::begin(&three_steps(), ExecutionMode::Normal);
        state.finish(Phase::Completed);
        assert!(!state.is_consistent());
    }

    #[test]
    fn test_progress_percent() {
        let mut state = ExecutionState::begin(&three_steps(), ExecutionMode::Normal);
        assert_eq!(state.progress_percent(), 0.0);
        state.set_outcome(0, StepOutcome::Succeeded);
        state.set_outcome(1, StepOutcome::Running);
        assert!((state.progress_percent() - 33.333).abs() < 0.01);

        let mut empty = ExecutionState::begin(&Sequence::new("empty"), ExecutionMode::Normal);
        assert_eq!(empty.current_index, None);
        empty.finish(Phase::Completed);
        assert_eq!(empty.progress_percent(), 100.0);
    }

    #[test]
    fn test_finish_sets_timestamp_once() {
        let mut state = ExecutionState::begin(&three_steps(), ExecutionMode::Normal);
        state.finish(Phase::Stopped);
        let first = state.finished_at;
        state.finish(Phase::Stopped);
        assert_eq!(state.finished_at, first);
    }

    #[test]
    fn test_phase_predicates() {
        assert!(Phase::Stopped.is_terminal());
        assert!(!Phase::Paused.is_terminal());
        assert!(Phase::Paused.is_active());
        assert!(!Phase::Idle.is_active());
    }

    #[test]
    fn test_failure_display() {
        let failure = StepFailure {
            kind: FailureKind::Timeout,
            message: "no response within 2s".into(),
            attempts: 1,
        };
        assert_eq!(
            StepOutcome::Failed(failure).to_string(),
            "Failed (timeout: no response within 2s (after 1 attempt))"
        );
    }
}
