//! Typed Step Operations
//!
//! A [`Step`] carries loosely typed parameters. Before anything touches the
//! control interface the step is resolved into an [`Operation`]: variables
//! are substituted, the kind's parameter schema is enforced and defaults are
//! applied. A step that fails to resolve never reaches the control system.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::model::{Parameters, Step, StepKind};
use super::variables::substitute;

/// Wait used for `WaitForEvent` steps that specify no timeout at all.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for `RunDiagnostic` steps without a step timeout.
pub const DEFAULT_DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(60);

/// A step parameter schema violation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("missing required parameter '{key}'")]
    MissingParameter { key: String },

    #[error("parameter '{key}' is invalid: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("parameter '{key}' references undefined variable '{name}'")]
    UndefinedVariable { key: String, name: String },

    #[error("timeout must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),
}

/// Severity of a `LogMessage` step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    /// Matching level for the `log` facade.
    pub fn to_log_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error | LogLevel::Critical => log::Level::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!(
                "'{}' is not one of: debug, info, warning, error, critical",
                other
            )),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fallback timeouts applied while resolving.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutDefaults {
    pub event: Duration,
    pub diagnostic: Duration,
}

impl Default for TimeoutDefaults {
    fn default() -> Self {
        Self {
            event: DEFAULT_EVENT_TIMEOUT,
            diagnostic: DEFAULT_DIAGNOSTIC_TIMEOUT,
        }
    }
}

/// A fully validated unit of work, one variant per [`StepKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    SetParameter {
        name: String,
        value: Value,
        unit: Option<String>,
    },
    WaitForEvent {
        event_name: String,
        timeout: Duration,
    },
    Delay {
        duration: Duration,
    },
    RunDiagnostic {
        diagnostic_name: String,
        params: Parameters,
        timeout: Duration,
    },
    LogMessage {
        message: String,
        level: LogLevel,
    },
}

impl Operation {
    pub fn kind(&self) -> StepKind {
        match self {
            Operation::SetParameter { .. } => StepKind::SetParameter,
            Operation::WaitForEvent { .. } => StepKind::WaitForEvent,
            Operation::Delay { .. } => StepKind::Delay,
            Operation::RunDiagnostic { .. } => StepKind::RunDiagnostic,
            Operation::LogMessage { .. } => StepKind::LogMessage,
        }
    }

    /// How long the operation itself is expected to block, if bounded.
    pub fn expected_duration(&self) -> Option<Duration> {
        match self {
            Operation::WaitForEvent { timeout, .. } => Some(*timeout),
            Operation::Delay { duration } => Some(*duration),
            Operation::RunDiagnostic { timeout, .. } => Some(*timeout),
            Operation::SetParameter { .. } | Operation::LogMessage { .. } => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::SetParameter { name, value, unit } => match unit {
                Some(unit) => write!(f, "set {} = {} {}", name, value, unit),
                None => write!(f, "set {} = {}", name, value),
            },
            Operation::WaitForEvent { event_name, timeout } => {
                write!(f, "wait for {} ({:.1}s)", event_name, timeout.as_secs_f64())
            }
            Operation::Delay { duration } => write!(f, "delay {:.3}s", duration.as_secs_f64()),
            Operation::RunDiagnostic {
                diagnostic_name, ..
            } => write!(f, "diagnostic {}", diagnostic_name),
            Operation::LogMessage { message, level } => write!(f, "log [{}] {}", level, message),
        }
    }
}

/// Resolves a step into its typed operation.
///
/// Applies variable substitution, validates the kind's required parameters
/// and fills in timeout defaults.
pub fn resolve(
    step: &Step,
    variables: &BTreeMap<String, Value>,
    defaults: &TimeoutDefaults,
) -> Result<Operation, SchemaError> {
    let step_timeout = step_timeout(step)?;

    let mut params = Parameters::new();
    for (key, value) in &step.parameters {
        params.insert(key.clone(), substitute(key, value, variables)?);
    }

    let operation = match step.kind {
        StepKind::SetParameter => {
            let name = required_string(&params, "name")?;
            let value = match params.get("value") {
                None | Some(Value::Null) => {
                    return Err(SchemaError::MissingParameter {
                        key: "value".to_string(),
                    })
                }
                Some(Value::Array(_)) | Some(Value::Object(_)) => {
                    return Err(SchemaError::InvalidParameter {
                        key: "value".to_string(),
                        reason: "must be a number, boolean or string".to_string(),
                    })
                }
                Some(value) => value.clone(),
            };
            let unit = optional_string(&params, "unit")?.or(optional_string(&params, "units")?);
            Operation::SetParameter { name, value, unit }
        }
        StepKind::WaitForEvent => {
            let event_name = required_string(&params, "event_name")?;
            let timeout = match params.get("timeout") {
                Some(_) => positive_seconds(&params, "timeout")?,
                None => step_timeout.unwrap_or(defaults.event),
            };
            Operation::WaitForEvent {
                event_name,
                timeout,
            }
        }
        StepKind::Delay => {
            if !params.contains_key("duration") {
                return Err(SchemaError::MissingParameter {
                    key: "duration".to_string(),
                });
            }
            Operation::Delay {
                duration: positive_seconds(&params, "duration")?,
            }
        }
        StepKind::RunDiagnostic => {
            let diagnostic_name = required_string(&params, "diagnostic_name")?;
            params.remove("diagnostic_name");
            Operation::RunDiagnostic {
                diagnostic_name,
                params,
                timeout: step_timeout.unwrap_or(defaults.diagnostic),
            }
        }
        StepKind::LogMessage => {
            let message = required_string(&params, "message")?;
            let level = match optional_string(&params, "level")?
                .or(optional_string(&params, "log_level")?)
            {
                Some(text) => text.parse().map_err(|reason| SchemaError::InvalidParameter {
                    key: "level".to_string(),
                    reason,
                })?,
                None => LogLevel::Info,
            };
            Operation::LogMessage { message, level }
        }
    };

    Ok(operation)
}

/// Validates and converts the step's own timeout.
pub fn step_timeout(step: &Step) -> Result<Option<Duration>, SchemaError> {
    match step.timeout_seconds {
        None => Ok(None),
        Some(seconds) => seconds_to_duration(seconds)
            .map(Some)
            .ok_or(SchemaError::InvalidTimeout(seconds)),
    }
}

fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

fn required_string(params: &Parameters, key: &str) -> Result<String, SchemaError> {
    match params.get(key) {
        None | Some(Value::Null) => Err(SchemaError::MissingParameter {
            key: key.to_string(),
        }),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(SchemaError::InvalidParameter {
            key: key.to_string(),
            reason: "must not be empty".to_string(),
        }),
        Some(_) => Err(SchemaError::InvalidParameter {
            key: key.to_string(),
            reason: "must be a string".to_string(),
        }),
    }
}

fn optional_string(params: &Parameters, key: &str) -> Result<Option<String>, SchemaError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(SchemaError::InvalidParameter {
            key: key.to_string(),
            reason: "must be a string".to_string(),
        }),
    }
}

fn positive_seconds(params: &Parameters, key: &str) -> Result<Duration, SchemaError> {
    let invalid = || SchemaError::InvalidParameter {
        key: key.to_string(),
        reason: "must be a positive number of seconds".to_string(),
    };

    params
        .get(key)
        .and_then(Value::as_f64)
        .and_then(seconds_to_duration)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars() -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    fn resolve_step(step: &Step) -> Result<Operation, SchemaError> {
        resolve(step, &no_vars(), &TimeoutDefaults::default())
    }

    #[test]
    fn test_resolve_set_parameter() {
        let step = Step::set_parameter("Magnet_Current_A", 100.5).with_parameter("units", "A");
        let op = resolve_step(&step).unwrap();

        assert_eq!(
            op,
            Operation::SetParameter {
                name: "Magnet_Current_A".to_string(),
                value: Value::from(100.5),
                unit: Some("A".to_string()),
            }
        );
        assert_eq!(op.kind(), StepKind::SetParameter);
    }

    #[test]
    fn test_set_parameter_requires_value() {
        let step = Step::new(StepKind::SetParameter).with_parameter("name", "X");
        assert_eq!(
            resolve_step(&step),
            Err(SchemaError::MissingParameter {
                key: "value".to_string()
            })
        );
    }

    #[test]
    fn test_set_parameter_rejects_compound_value() {
        let step = Step::set_parameter("X", serde_json::json!([1, 2]));
        assert!(matches!(
            resolve_step(&step),
            Err(SchemaError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_wait_for_event_timeout_precedence() {
        let explicit = Step::wait_for_event("Beam_Ready_Signal", 5.0).with_timeout(8.0);
        match resolve_step(&explicit).unwrap() {
            Operation::WaitForEvent { timeout, .. } => assert_eq!(timeout, Duration::from_secs(5)),
            other => panic!("unexpected {:?}", other),
        }

        let from_step = Step::new(StepKind::WaitForEvent)
            .with_parameter("event_name", "Vacuum_Ready")
            .with_timeout(8.0);
        match resolve_step(&from_step).unwrap() {
            Operation::WaitForEvent { timeout, .. } => assert_eq!(timeout, Duration::from_secs(8)),
            other => panic!("unexpected {:?}", other),
        }

        let defaulted = Step::new(StepKind::WaitForEvent).with_parameter("event_name", "Vacuum_Ready");
        match resolve_step(&defaulted).unwrap() {
            Operation::WaitForEvent { timeout, .. } => assert_eq!(timeout, DEFAULT_EVENT_TIMEOUT),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_delay_must_be_positive() {
        assert!(resolve_step(&Step::delay(0.0)).is_err());
        assert!(resolve_step(&Step::delay(-1.0)).is_err());
        assert!(resolve_step(&Step::delay(0.25)).is_ok());

        let missing = Step::new(StepKind::Delay);
        assert_eq!(
            resolve_step(&missing),
            Err(SchemaError::MissingParameter {
                key: "duration".to_string()
            })
        );
    }

    #[test]
    fn test_run_diagnostic_passes_extra_parameters() {
        let mut params = Parameters::new();
        params.insert("tolerance".into(), Value::from(0.1));
        let step = Step::run_diagnostic("Beam_Position_Check", params);

        match resolve_step(&step).unwrap() {
            Operation::RunDiagnostic {
                diagnostic_name,
                params,
                timeout,
            } => {
                assert_eq!(diagnostic_name, "Beam_Position_Check");
                assert_eq!(params.len(), 1);
                assert_eq!(params["tolerance"], 0.1);
                assert_eq!(timeout, DEFAULT_DIAGNOSTIC_TIMEOUT);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_log_message_levels() {
        let step = Step::log_message("hello", "WARNING");
        match resolve_step(&step).unwrap() {
            Operation::LogMessage { level, .. } => assert_eq!(level, LogLevel::Warning),
            other => panic!("unexpected {:?}", other),
        }

        let legacy = Step::new(StepKind::LogMessage)
            .with_parameter("message", "hello")
            .with_parameter("log_level", "debug");
        match resolve_step(&legacy).unwrap() {
            Operation::LogMessage { level, .. } => assert_eq!(level, LogLevel::Debug),
            other => panic!("unexpected {:?}", other),
        }

        let bad = Step::log_message("hello", "loud");
        assert!(resolve_step(&bad).is_err());
    }

    #[test]
    fn test_empty_message_rejected() {
        let step = Step::log_message("   ", "info");
        assert!(matches!(
            resolve_step(&step),
            Err(SchemaError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_invalid_step_timeout() {
        let step = Step::delay(1.0).with_timeout(0.0);
        assert_eq!(resolve_step(&step), Err(SchemaError::InvalidTimeout(0.0)));

        let step = Step::delay(1.0).with_timeout(-3.0);
        assert_eq!(resolve_step(&step), Err(SchemaError::InvalidTimeout(-3.0)));
    }

    #[test]
    fn test_variables_substituted() {
        let mut vars = BTreeMap::new();
        vars.insert("current".to_string(), Value::from(250));
        let step = Step::set_parameter("Magnet_Current_A", "${current}");

        let op = resolve(&step, &vars, &TimeoutDefaults::default()).unwrap();
        match op {
            Operation::SetParameter { value, .. } => assert_eq!(value, Value::from(250)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_undefined_variable_is_schema_error() {
        let step = Step::set_parameter("Magnet_Current_A", "${current}");
        assert!(matches!(
            resolve_step(&step),
            Err(SchemaError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(LogLevel::Critical.to_log_level(), log::Level::Error);
        assert_eq!(LogLevel::Warning.to_log_level(), log::Level::Warn);
        assert_eq!("Info".parse::<LogLevel>(), Ok(LogLevel::Info));
    }
}
