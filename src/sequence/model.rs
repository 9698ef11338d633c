//! Sequence Data Model
//!
//! Core data structures describing an operational sequence and its steps.
//!
//! # Example YAML Format
//!
//! ```yaml
//! metadata:
//!   name: Beam Setup
//! variables:
//!   magnet_current: 100.5
//! steps:
//!   - id: set_magnet
//!     kind: SetParameter
//!     parameters:
//!       name: Magnet_Current_A
//!       value: ${magnet_current}
//!       unit: A
//!     retry_limit: 2
//!
//!   - id: settle
//!     kind: Delay
//!     parameters:
//!       duration: 2.0
//!
//!   - id: beam_ready
//!     kind: WaitForEvent
//!     parameters:
//!       event_name: Beam_Ready_Signal
//!       timeout: 10
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Parameter mapping carried by a step. The schema depends on [`StepKind`].
pub type Parameters = Map<String, Value>;

/// The closed set of step kinds understood by the executor.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    SetParameter,
    WaitForEvent,
    Delay,
    RunDiagnostic,
    LogMessage,
}

impl StepKind {
    /// All kinds, in declaration order.
    pub const ALL: [StepKind; 5] = [
        StepKind::SetParameter,
        StepKind::WaitForEvent,
        StepKind::Delay,
        StepKind::RunDiagnostic,
        StepKind::LogMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::SetParameter => "SetParameter",
            StepKind::WaitForEvent => "WaitForEvent",
            StepKind::Delay => "Delay",
            StepKind::RunDiagnostic => "RunDiagnostic",
            StepKind::LogMessage => "LogMessage",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the run does once a step has exhausted its retries.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the run; remaining steps are skipped.
    #[default]
    Abort,
    /// Carry on with the next step. The run still finishes as failed.
    Continue,
}

/// Represents a single step in a sequence.
///
/// A step is an immutable description of one unit of work: what to do
/// (`kind` + `parameters`) and how hard to try (`timeout_seconds`,
/// `retry_limit`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier, stable for the lifetime of the sequence
    #[serde(default = "new_id")]
    pub id: String,

    /// Which control operation this step performs
    pub kind: StepKind,

    /// Kind-specific parameters
    #[serde(default)]
    pub parameters: Parameters,

    /// Free-form operator note
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Disabled steps are recorded as skipped and never executed
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Deadline for a single attempt, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,

    /// Additional attempts after a failed one
    #[serde(default)]
    pub retry_limit: u32,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_enabled() -> bool {
    true
}

impl Step {
    /// Creates a step of the given kind with no parameters.
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: new_id(),
            kind,
            parameters: Parameters::new(),
            description: String::new(),
            enabled: true,
            timeout_seconds: None,
            retry_limit: 0,
        }
    }

    /// Creates a `SetParameter` step.
    ///
    /// # Example
    ///
    /// ```
    /// use sequencer::sequence::Step;
    ///
    /// let step = Step::set_parameter("Magnet_Current_A", 100.5)
    ///     .with_parameter("unit", "A")
    ///     .with_retries(2);
    /// assert_eq!(step.retry_limit, 2);
    /// ```
    pub fn set_parameter(name: &str, value: impl Into<Value>) -> Self {
        Self::new(StepKind::SetParameter)
            .with_parameter("name", name)
            .with_parameter("value", value)
            .with_description(format!("Set {}", name))
    }

    /// Creates a `WaitForEvent` step.
    pub fn wait_for_event(event_name: &str, timeout_seconds: f64) -> Self {
        Self::new(StepKind::WaitForEvent)
            .with_parameter("event_name", event_name)
            .with_parameter("timeout", timeout_seconds)
            .with_description(format!(
                "Wait for {} (timeout: {}s)",
                event_name, timeout_seconds
            ))
    }

    /// Creates a `Delay` step.
    pub fn delay(duration_seconds: f64) -> Self {
        Self::new(StepKind::Delay)
            .with_parameter("duration", duration_seconds)
            .with_description(format!("Delay for {} seconds", duration_seconds))
    }

    /// Creates a `RunDiagnostic` step. Extra parameters are passed to the diagnostic.
    pub fn run_diagnostic(diagnostic_name: &str, params: Parameters) -> Self {
        let mut step = Self::new(StepKind::RunDiagnostic)
            .with_parameter("diagnostic_name", diagnostic_name)
            .with_description(format!("Run diagnostic: {}", diagnostic_name));
        step.parameters.extend(params);
        step
    }

    /// Creates a `LogMessage` step.
    pub fn log_message(message: &str, level: &str) -> Self {
        Self::new(StepKind::LogMessage)
            .with_parameter("message", message)
            .with_parameter("level", level)
            .with_description(format!("Log: {}", message))
    }

    /// Replaces the generated identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into().trim().to_string();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets one parameter, overwriting any previous value.
    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Sets the per-attempt deadline in seconds.
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Sets the number of additional attempts after a failure.
    pub fn with_retries(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Marks the step as disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Total attempts the executor may make.
    pub fn max_attempts(&self) -> u32 {
        self.retry_limit.saturating_add(1)
    }
}

/// Descriptive information about a sequence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SequenceMetadata {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(default = "default_category")]
    pub category: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_category() -> String {
    "General".to_string()
}

impl SequenceMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: String::new(),
            version: default_version(),
            author: String::new(),
            category: default_category(),
            tags: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// An ordered, named collection of steps plus shared variables.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sequence {
    #[serde(default = "new_id")]
    pub id: String,

    pub metadata: SequenceMetadata,

    /// Steps, executed strictly in this order
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Values available to `${name}` references in string parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Sequence {
    /// Creates an empty sequence.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            metadata: SequenceMetadata::new(name),
            steps: Vec::new(),
            variables: BTreeMap::new(),
            failure_policy: FailurePolicy::Abort,
        }
    }

    /// Creates a sequence from a list of steps.
    pub fn from_steps(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut sequence = Self::new(name);
        sequence.steps = steps;
        sequence
    }

    /// Sets the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Binds a variable.
    pub fn with_variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(name.to_string(), value.into());
        self
    }

    /// Appends a step and returns its ID.
    pub fn add_step(&mut self, step: Step) -> Result<String, String> {
        let index = self.steps.len();
        self.insert_step(index, step)
    }

    /// Inserts a step at `index` and returns its ID.
    pub fn insert_step(&mut self, index: usize, step: Step) -> Result<String, String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        if index > self.steps.len() {
            return Err(format!(
                "Index {} is out of range for {} steps",
                index,
                self.steps.len()
            ));
        }
        let id = step.id.clone();
        self.steps.insert(index, step);
        self.touch();
        Ok(id)
    }

    /// Removes a step from the sequence.
    pub fn remove_step(&mut self, id: &str) -> Result<Step, String> {
        let index = self
            .step_index(id)
            .ok_or_else(|| format!("Step '{}' not found", id))?;
        let step = self.steps.remove(index);
        self.touch();
        Ok(step)
    }

    /// Moves a step to a new position.
    pub fn move_step(&mut self, id: &str, new_index: usize) -> Result<(), String> {
        if new_index >= self.steps.len() {
            return Err(format!(
                "Index {} is out of range for {} steps",
                new_index,
                self.steps.len()
            ));
        }
        let step = self.remove_step(id)?;
        self.steps.insert(new_index, step);
        self.touch();
        Ok(())
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Gets a mutable reference to a step by ID.
    pub fn get_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Position of a step within the sequence.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Returns only the enabled steps.
    pub fn enabled_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.enabled).collect()
    }

    /// Returns the steps of one kind.
    pub fn steps_of_kind(&self, kind: StepKind) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.kind == kind).collect()
    }

    /// Copies the sequence with fresh sequence and step IDs.
    pub fn duplicate(&self, new_name: Option<&str>) -> Self {
        let name = match new_name {
            Some(name) => name.to_string(),
            None => format!("{} (Copy)", self.metadata.name),
        };

        let mut copy = self.clone();
        copy.id = new_id();
        copy.metadata.name = name;
        copy.metadata.created_at = Utc::now();
        copy.metadata.modified_at = copy.metadata.created_at;
        for step in &mut copy.steps {
            step.id = new_id();
        }
        copy
    }

    /// Returns the number of steps in the sequence.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the sequence has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Beam setup demonstration sequence.
    pub fn example() -> Self {
        let mut sequence = Self::new("Example Beam Setup Sequence");
        sequence.metadata.description =
            "A sample sequence for setting up particle beam parameters".to_string();
        sequence.metadata.author = "Sequencer".to_string();
        sequence.metadata.category = "Beam Setup".to_string();
        sequence.metadata.tags = vec!["example".into(), "beam".into(), "setup".into()];
        sequence
            .variables
            .insert("magnet_current".to_string(), Value::from(100.5));

        let mut tolerance = Parameters::new();
        tolerance.insert("tolerance".to_string(), Value::from(0.1));
        tolerance.insert("max_iterations".to_string(), Value::from(5));

        sequence.steps = vec![
            Step::set_parameter("Magnet_Current_A", "${magnet_current}")
                .with_id("set_magnet_current")
                .with_parameter("unit", "A")
                .with_description("Set main magnet current to operational level"),
            Step::delay(2.0)
                .with_id("magnet_settle")
                .with_description("Wait for magnet field to stabilize"),
            Step::set_parameter("RF_Frequency_B", 400.12)
                .with_id("set_rf_frequency")
                .with_parameter("unit", "MHz")
                .with_description("Set RF frequency for beam acceleration"),
            Step::wait_for_event("Beam_Ready_Signal", 10.0)
                .with_id("beam_ready")
                .with_description("Wait for beam ready confirmation"),
            Step::run_diagnostic("Beam_Position_Check", tolerance)
                .with_id("beam_position_check")
                .with_retries(1)
                .with_description("Verify beam position within tolerance"),
            Step::log_message("Beam setup sequence completed successfully", "info")
                .with_id("log_completion")
                .with_description("Log completion status"),
        ];
        sequence
    }

    fn touch(&mut self) {
        self.metadata.modified_at = Utc::now();
    }
}
