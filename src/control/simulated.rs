//! Simulated Control System
//!
//! An in-memory stand-in for the accelerator control system, used by the
//! CLI and for demonstrations. Behavior is deterministic:
//! - Parameters are stored as given (numeric strings become numbers)
//! - Events flagged ready arrive after a fixed latency, others never arrive
//!   until raised
//! - Diagnostics pass unless listed in `failing_diagnostics`

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{sleep_or_cancel, ControlError, ControlInterface, DelayOutcome, DiagnosticVerdict, EventWait};
use crate::sequence::{LogLevel, Parameters};

/// Maximum number of entries kept in the log buffer.
pub const LOG_BUFFER_LIMIT: usize = 1000;

/// Interval between event status checks.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accepted range for `Magnet_*` parameters before a warning is logged.
const MAGNET_RANGE: (f64, f64) = (0.0, 1000.0);

/// Tunables for [`SimulatedControl`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Processing time of set-parameter and diagnostic calls
    pub operation_latency_ms: u64,

    /// Time for a ready event to be reported
    pub event_latency_ms: u64,

    /// Diagnostics that always report a failure
    pub failing_diagnostics: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            operation_latency_ms: 100,
            event_latency_ms: 500,
            failing_diagnostics: Vec::new(),
        }
    }
}

impl SimulationConfig {
    pub fn operation_latency(&self) -> Duration {
        Duration::from_millis(self.operation_latency_ms)
    }

    pub fn event_latency(&self) -> Duration {
        Duration::from_millis(self.event_latency_ms)
    }
}

/// An entry in the simulated log buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A completed diagnostic run.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticRun {
    pub name: String,
    pub params: Parameters,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of the simulated system.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub parameters_count: usize,
    pub events_count: usize,
    pub diagnostics_count: usize,
    pub log_entries_count: usize,
    pub last_operation: Option<DateTime<Utc>>,
}

struct SimState {
    parameters: BTreeMap<String, Value>,
    events: BTreeMap<String, bool>,
    diagnostics: Vec<DiagnosticRun>,
    log_buffer: VecDeque<LogEntry>,
    last_operation: Option<DateTime<Utc>>,
}

impl SimState {
    fn initial() -> Self {
        let parameters = [
            ("Magnet_Current_A", Value::from(100.5)),
            ("RF_Frequency_B", Value::from(400.12)),
            ("Beam_Position_X", Value::from(0.0)),
            ("Beam_Position_Y", Value::from(0.0)),
            ("Quadrupole_1", Value::from(1.0)),
            ("Quadrupole_2", Value::from(1.2)),
            ("Steering_Coil_1", Value::from(0.5)),
            ("Vacuum_Pressure", Value::from(1e-9)),
            ("Temperature_Sensor_1", Value::from(25.0)),
        ];

        let events = [
            ("Beam_Ready_Signal", true),
            ("Beam_Position_Stable", true),
            ("Vacuum_Ready", true),
            ("RF_System_Ready", true),
            ("Magnet_System_Ready", true),
            ("Emergency_Stop", false),
            ("Beam_Dump_Complete", false),
        ];

        Self {
            parameters: parameters
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            events: events.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            diagnostics: Vec::new(),
            log_buffer: VecDeque::new(),
            last_operation: None,
        }
    }
}

/// Deterministic simulation of the controlled system.
///
/// # Example
///
/// ```
/// use sequencer::control::{SimulatedControl, SimulationConfig};
///
/// let control = SimulatedControl::new(SimulationConfig::default());
/// assert_eq!(control.parameter("Quadrupole_1"), Some(1.0.into()));
/// ```
pub struct SimulatedControl {
    config: SimulationConfig,
    state: Mutex<SimState>,
}

impl Default for SimulatedControl {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl SimulatedControl {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState::initial()),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current value of a parameter.
    pub fn parameter(&self, name: &str) -> Option<Value> {
        self.state().parameters.get(name).cloned()
    }

    /// Whether a known event is currently ready; `None` for unknown events.
    pub fn event_ready(&self, event_name: &str) -> Option<bool> {
        self.state().events.get(event_name).copied()
    }

    /// Marks an event as occurred, registering it if unknown.
    pub fn raise_event(&self, event_name: &str) {
        info!("Event raised: {}", event_name);
        self.state().events.insert(event_name.to_string(), true);
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.state().log_buffer.iter().cloned().collect()
    }

    pub fn diagnostic_runs(&self) -> Vec<DiagnosticRun> {
        self.state().diagnostics.clone()
    }

    pub fn status(&self) -> SystemStatus {
        let state = self.state();
        SystemStatus {
            parameters_count: state.parameters.len(),
            events_count: state.events.len(),
            diagnostics_count: state.diagnostics.len(),
            log_entries_count: state.log_buffer.len(),
            last_operation: state.last_operation,
        }
    }

    /// Restores the initial parameters and events and clears all history.
    pub fn reset(&self) {
        info!("Resetting simulated control system");
        *self.state() = SimState::initial();
    }

    fn touch(&self) {
        self.state().last_operation = Some(Utc::now());
    }
}

/// Numeric strings are stored as numbers.
fn normalize_value(value: &Value) -> Value {
    if let Value::String(text) = value {
        let text = text.trim();
        if let Ok(int) = text.parse::<i64>() {
            return Value::from(int);
        }
        if let Ok(float) = text.parse::<f64>() {
            if float.is_finite() {
                return Value::from(float);
            }
        }
    }
    value.clone()
}

#[async_trait]
impl ControlInterface for SimulatedControl {
    async fn set_parameter(
        &self,
        name: &str,
        value: &Value,
        unit: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), ControlError> {
        debug!("Setting parameter '{}' to {} {}", name, value, unit.unwrap_or(""));

        if !sleep_or_cancel(self.config.operation_latency(), cancel).await {
            return Err(ControlError::Cancelled);
        }

        let value = normalize_value(value);
        if name.starts_with("Magnet_") {
            if let Some(number) = value.as_f64() {
                if number < MAGNET_RANGE.0 || number > MAGNET_RANGE.1 {
                    warn!(
                        "Parameter '{}' value {} is outside normal range ({}-{})",
                        name, number, MAGNET_RANGE.0, MAGNET_RANGE.1
                    );
                }
            }
        }

        self.state().parameters.insert(name.to_string(), value);
        self.touch();
        Ok(())
    }

    async fn wait_for_event(
        &self,
        event_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EventWait, ControlError> {
        debug!("Waiting for event '{}' (timeout: {:?})", event_name, timeout);
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(EventWait::TimedOut);
            }
            let remaining = deadline - now;

            if self.event_ready(event_name) == Some(true) {
                let latency = self.config.event_latency();
                if !sleep_or_cancel(latency.min(remaining), cancel).await {
                    return Err(ControlError::Cancelled);
                }
                if latency > remaining {
                    return Ok(EventWait::TimedOut);
                }
                self.touch();
                return Ok(EventWait::Occurred);
            }

            if !sleep_or_cancel(EVENT_POLL_INTERVAL.min(remaining), cancel).await {
                return Err(ControlError::Cancelled);
            }
        }
    }

    async fn delay(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<DelayOutcome, ControlError> {
        debug!("Delaying for {:?}", duration);
        if sleep_or_cancel(duration, cancel).await {
            self.touch();
            Ok(DelayOutcome::Completed)
        } else {
            Ok(DelayOutcome::Cancelled)
        }
    }

    async fn run_diagnostic(
        &self,
        diagnostic_name: &str,
        params: &Parameters,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DiagnosticVerdict, ControlError> {
        debug!("Running diagnostic '{}'", diagnostic_name);

        let test_duration = self.config.operation_latency().min(timeout);
        if !sleep_or_cancel(test_duration, cancel).await {
            return Err(ControlError::Cancelled);
        }

        let passed = !self
            .config
            .failing_diagnostics
            .iter()
            .any(|name| name == diagnostic_name);

        {
            let mut state = self.state();
            state.diagnostics.push(DiagnosticRun {
                name: diagnostic_name.to_string(),
                params: params.clone(),
                passed,
                timestamp: Utc::now(),
            });
            state.last_operation = Some(Utc::now());
        }

        if passed {
            Ok(DiagnosticVerdict::Passed)
        } else {
            Ok(DiagnosticVerdict::Failed(format!(
                "{} reported out-of-tolerance results",
                diagnostic_name
            )))
        }
    }

    async fn log_message(
        &self,
        text: &str,
        level: LogLevel,
        _cancel: &CancellationToken,
    ) -> Result<(), ControlError> {
        log::log!(target: "control", level.to_log_level(), "{}", text);

        let mut state = self.state();
        state.log_buffer.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message: text.to_string(),
        });
        while state.log_buffer.len() > LOG_BUFFER_LIMIT {
            state.log_buffer.pop_front();
        }
        state.last_operation = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> SimulatedControl {
        SimulatedControl::new(SimulationConfig {
            operation_latency_ms: 10,
            event_latency_ms: 50,
            failing_diagnostics: vec!["Vacuum_Leak_Check".to_string()],
        })
    }

    #[test]
    fn test_default_parameters() {
        let control = SimulatedControl::default();
        assert_eq!(control.parameter("Magnet_Current_A"), Some(Value::from(100.5)));
        assert_eq!(control.parameter("Vacuum_Pressure"), Some(Value::from(1e-9)));
        assert_eq!(control.parameter("Unknown"), None);
        assert_eq!(control.status().parameters_count, 9);
        assert_eq!(control.status().events_count, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_parameter_normalizes_numbers() {
        let control = control();
        let token = CancellationToken::new();

        control
            .set_parameter("Quadrupole_1", &Value::from("2.5"), Some("T"), &token)
            .await
            .unwrap();
        assert_eq!(control.parameter("Quadrupole_1"), Some(Value::from(2.5)));

        control
            .set_parameter("Mode", &Value::from("standby"), None, &token)
            .await
            .unwrap();
        assert_eq!(control.parameter("Mode"), Some(Value::from("standby")));
        assert!(control.status().last_operation.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_magnet_still_succeeds() {
        let control = control();
        let token = CancellationToken::new();
        let result = control
            .set_parameter("Magnet_Current_A", &Value::from(1500), None, &token)
            .await;
        assert!(result.is_ok());
        assert_eq!(control.parameter("Magnet_Current_A"), Some(Value::from(1500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_event_occurs() {
        let control = control();
        let token = CancellationToken::new();
        let result = control
            .wait_for_event("Vacuum_Ready", Duration::from_secs(1), &token)
            .await;
        assert_eq!(result, Ok(EventWait::Occurred));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_event_times_out() {
        let control = control();
        let token = CancellationToken::new();
        let start = Instant::now();
        let result = control
            .wait_for_event("Beam_Dump_Complete", Duration::from_secs(2), &token)
            .await;
        assert_eq!(result, Ok(EventWait::TimedOut));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_raised_event_is_observed() {
        let control = std::sync::Arc::new(control());
        let token = CancellationToken::new();

        let raiser = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            raiser.raise_event("Emergency_Stop");
        });

        let result = control
            .wait_for_event("Emergency_Stop", Duration::from_secs(5), &token)
            .await;
        assert_eq!(result, Ok(EventWait::Occurred));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_observes_cancellation() {
        let control = control();
        let token = CancellationToken::new();
        token.cancel();

        let result = control.delay(Duration::from_secs(30), &token).await;
        assert_eq!(result, Ok(DelayOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostics_verdicts() {
        let control = control();
        let token = CancellationToken::new();
        let params = Parameters::new();

        let passed = control
            .run_diagnostic("Beam_Position_Check", &params, Duration::from_secs(5), &token)
            .await;
        assert_eq!(passed, Ok(DiagnosticVerdict::Passed));

        let failed = control
            .run_diagnostic("Vacuum_Leak_Check", &params, Duration::from_secs(5), &token)
            .await;
        assert!(matches!(failed, Ok(DiagnosticVerdict::Failed(_))));

        let runs = control.diagnostic_runs();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].passed);
        assert!(!runs[1].passed);
    }

    #[tokio::test]
    async fn test_log_buffer_is_capped() {
        let control = control();
        let token = CancellationToken::new();

        for i in 0..(LOG_BUFFER_LIMIT + 5) {
            control
                .log_message(&format!("entry {}", i), LogLevel::Info, &token)
                .await
                .unwrap();
        }

        let entries = control.log_entries();
        assert_eq!(entries.len(), LOG_BUFFER_LIMIT);
        assert_eq!(entries[0].message, "entry 5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_defaults() {
        let control = control();
        let token = CancellationToken::new();
        control
            .set_parameter("Quadrupole_1", &Value::from(9.0), None, &token)
            .await
            .unwrap();
        control.raise_event("Beam_Dump_Complete");

        control.reset();
        assert_eq!(control.parameter("Quadrupole_1"), Some(Value::from(1.0)));
        assert_eq!(control.event_ready("Beam_Dump_Complete"), Some(false));
        assert!(control.status().last_operation.is_none());
    }
}
