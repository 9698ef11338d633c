//! Sequence Validation
//!
//! Upstream checks performed before a sequence is handed to the executor:
//! - Sequence name present
//! - Step identifiers present and unique
//! - Every enabled step resolves against its kind's parameter schema
//!
//! The executor repeats the schema check per step at run time, so a
//! sequence that skipped validation still cannot crash a run.

use std::collections::HashSet;

use log::{debug, info};
use thiserror::Error;

use super::model::Sequence;
use super::operation::{resolve, SchemaError, TimeoutDefaults};

/// Validation error types for user-friendly error messages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Sequence name cannot be empty")]
    EmptyName,

    #[error("Step {0} has empty or whitespace-only ID")]
    EmptyStepId(usize),

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step {index} ('{step}'): {source}")]
    Schema {
        index: usize,
        step: String,
        source: SchemaError,
    },
}

/// All problems found in one validation pass.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{}", join_errors(.0))]
pub struct ValidationErrors(pub Vec<ValidationError>);

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validates the entire sequence.
///
/// Step numbers in messages are 1-based, matching what an operator sees.
/// An empty sequence is valid; running it completes immediately.
pub fn validate_sequence(sequence: &Sequence) -> Result<(), ValidationErrors> {
    info!(
        "Validating sequence '{}' with {} steps",
        sequence.metadata.name,
        sequence.len()
    );

    let errors = collect_errors(sequence);
    if !errors.is_empty() {
        return Err(ValidationErrors(errors));
    }

    info!("Sequence '{}' validated", sequence.metadata.name);
    Ok(())
}

/// Quick validation that returns a list of error messages.
///
/// Useful for editor feedback.
pub fn quick_validate(sequence: &Sequence) -> Vec<String> {
    collect_errors(sequence)
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn collect_errors(sequence: &Sequence) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if sequence.metadata.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    let defaults = TimeoutDefaults::default();

    for (i, step) in sequence.steps.iter().enumerate() {
        let number = i + 1;

        if step.id.trim().is_empty() {
            errors.push(ValidationError::EmptyStepId(number));
        } else if !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }

        if !step.enabled {
            debug!("Step '{}' is disabled - schema not checked", step.id);
            continue;
        }

        if let Err(source) = resolve(step, &sequence.variables, &defaults) {
            errors.push(ValidationError::Schema {
                index: number,
                step: step.id.clone(),
                source,
            });
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::model::{Step, StepKind};

    #[test]
    fn test_valid_sequence() {
        let sequence = Sequence::example();
        assert!(validate_sequence(&sequence).is_ok());
    }

    #[test]
    fn test_empty_sequence_is_valid() {
        let sequence = Sequence::new("empty");
        assert!(validate_sequence(&sequence).is_ok());
    }

    #[test]
    fn test_empty_name() {
        let sequence = Sequence::new("   ");
        let errors = validate_sequence(&sequence).unwrap_err();
        assert_eq!(errors.0, vec![ValidationError::EmptyName]);
    }

    #[test]
    fn test_duplicate_ids() {
        let sequence = Sequence::from_steps(
            "test",
            vec![
                Step::delay(1.0).with_id("same_id"),
                Step::delay(2.0).with_id("same_id"),
            ],
        );

        let errors = validate_sequence(&sequence).unwrap_err();
        assert!(errors
            .0
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateStepId(id) if id == "same_id")));
    }

    #[test]
    fn test_empty_step_id() {
        let mut step = Step::delay(1.0);
        step.id = "  ".to_string();
        let sequence = Sequence::from_steps("test", vec![step]);

        let errors = validate_sequence(&sequence).unwrap_err();
        assert_eq!(errors.0, vec![ValidationError::EmptyStepId(1)]);
    }

    #[test]
    fn test_schema_errors_reported_per_step() {
        let sequence = Sequence::from_steps(
            "test",
            vec![
                Step::delay(1.0),
                Step::new(StepKind::WaitForEvent).with_id("no_event"),
                Step::delay(1.0).with_timeout(0.0).with_id("zero_timeout"),
            ],
        );

        let errors = validate_sequence(&sequence).unwrap_err();
        assert_eq!(errors.0.len(), 2);
        assert!(matches!(
            &errors.0[0],
            ValidationError::Schema { index: 2, step, .. } if step == "no_event"
        ));
        assert!(matches!(
            &errors.0[1],
            ValidationError::Schema { index: 3, source: SchemaError::InvalidTimeout(_), .. }
        ));
    }

    #[test]
    fn test_disabled_steps_not_schema_checked() {
        let sequence = Sequence::from_steps(
            "test",
            vec![Step::new(StepKind::Delay).with_id("draft").disabled()],
        );
        assert!(validate_sequence(&sequence).is_ok());
    }

    #[test]
    fn test_quick_validate_messages() {
        let sequence = Sequence::from_steps(
            "",
            vec![Step::new(StepKind::LogMessage).with_id("log")],
        );

        let messages = quick_validate(&sequence);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "Sequence name cannot be empty");
        assert!(messages[1].contains("missing required parameter 'message'"));
    }

    #[test]
    fn test_errors_display_joined() {
        let errors = ValidationErrors(vec![
            ValidationError::EmptyName,
            ValidationError::DuplicateStepId("a".into()),
        ]);
        assert_eq!(
            errors.to_string(),
            "Sequence name cannot be empty\nDuplicate step ID: 'a'"
        );
    }
}
