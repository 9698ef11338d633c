//! Sequence Definition Module
//!
//! Provides data structures and utilities for defining, persisting and
//! validating operational sequences.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Sequence)
//! - [`operation`]: Typed operations and the per-kind parameter schema
//! - [`variables`]: `${name}` variable substitution
//! - [`validator`]: Validation rules applied before execution
//! - [`parser`]: JSON/YAML loading and saving

pub mod model;
pub mod operation;
pub mod parser;
pub mod validator;
pub mod variables;

pub use model::{FailurePolicy, Parameters, Sequence, SequenceMetadata, Step, StepKind};
pub use operation::{resolve, LogLevel, Operation, SchemaError, TimeoutDefaults};
pub use parser::{load_sequence, save_sequence, Format, SequenceError};
pub use validator::{quick_validate, validate_sequence, ValidationError, ValidationErrors};
