//! Sequence Files
//!
//! Loading and saving sequence definitions. The format is picked from the
//! file extension: `.json`, `.yaml` or `.yml`. Loaded sequences are
//! validated before they are returned.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use super::model::Sequence;
use super::validator::{validate_sequence, ValidationErrors};

/// Errors raised while reading or writing sequence files.
#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("Failed to read or write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unsupported sequence format '{0}' (expected .json, .yaml or .yml)")]
    UnsupportedFormat(String),

    #[error("Failed to parse sequence YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse sequence JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sequence is invalid:\n{0}")]
    Invalid(#[from] ValidationErrors),
}

/// On-disk representation of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// Picks the format from a path's extension.
    pub fn from_path(path: &Path) -> Result<Self, SequenceError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "json" => Ok(Format::Json),
            "yaml" | "yml" => Ok(Format::Yaml),
            _ => Err(SequenceError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Parses a sequence from text without validating it.
pub fn parse_sequence(content: &str, format: Format) -> Result<Sequence, SequenceError> {
    let sequence = match format {
        Format::Json => serde_json::from_str(content)?,
        Format::Yaml => serde_yaml::from_str(content)?,
    };
    Ok(sequence)
}

/// Renders a sequence as text.
pub fn render_sequence(sequence: &Sequence, format: Format) -> Result<String, SequenceError> {
    let text = match format {
        Format::Json => serde_json::to_string_pretty(sequence)?,
        Format::Yaml => serde_yaml::to_string(sequence)?,
    };
    Ok(text)
}

/// Loads a sequence from a file.
///
/// # Example
///
/// ```rust,no_run
/// use sequencer::sequence::load_sequence;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let sequence = load_sequence("beam_setup.yaml")?;
///     println!("Loaded {} steps", sequence.len());
///     Ok(())
/// }
/// ```
pub fn load_sequence(path: impl AsRef<Path>) -> Result<Sequence, SequenceError> {
    let path = path.as_ref();
    info!("Loading sequence from: {}", path.display());

    let format = Format::from_path(path)?;
    let content = fs::read_to_string(path).map_err(|source| SequenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    debug!("Sequence content loaded ({} bytes)", content.len());

    let sequence = parse_sequence(&content, format)?;
    info!(
        "Parsed sequence '{}' with {} steps",
        sequence.metadata.name,
        sequence.len()
    );

    validate_sequence(&sequence)?;
    Ok(sequence)
}

/// Saves a sequence to a file.
///
/// An existing file is first copied to `<path>.bak`.
pub fn save_sequence(sequence: &Sequence, path: impl AsRef<Path>) -> Result<(), SequenceError> {
    let path = path.as_ref();
    let format = Format::from_path(path)?;
    let content = render_sequence(sequence, format)?;

    if path.exists() {
        let backup = backup_path(path);
        match fs::copy(path, &backup) {
            Ok(_) => debug!("Backed up {} to {}", path.display(), backup.display()),
            Err(e) => warn!("Failed to back up {}: {}", path.display(), e),
        }
    }

    fs::write(path, content).map_err(|source| SequenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Sequence saved to: {}", path.display());
    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::model::{Step, StepKind};
    use tempfile::tempdir;

    #[test]
    fn test_format_from_path() {
        assert_eq!(Format::from_path(Path::new("a.json")).unwrap(), Format::Json);
        assert_eq!(Format::from_path(Path::new("a.YAML")).unwrap(), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("a.yml")).unwrap(), Format::Yaml);
        assert!(matches!(
            Format::from_path(Path::new("a.txt")),
            Err(SequenceError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_load_sequence_valid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("beam.yaml");

        let yaml_content = r#"
metadata:
  name: Beam Setup
variables:
  current: 120
steps:
  - id: magnet
    kind: SetParameter
    parameters:
      name: Magnet_Current_A
      value: ${current}
    retry_limit: 1
  - id: settle
    kind: Delay
    parameters:
      duration: 0.5
    enabled: false
"#;
        fs::write(&path, yaml_content).unwrap();

        let sequence = load_sequence(&path).unwrap();
        assert_eq!(sequence.metadata.name, "Beam Setup");
        assert_eq!(sequence.len(), 2);
        assert_eq!(sequence.steps[0].kind, StepKind::SetParameter);
        assert_eq!(sequence.steps[0].retry_limit, 1);
        assert!(!sequence.steps[1].enabled);
    }

    #[test]
    fn test_load_sequence_file_not_found() {
        let result = load_sequence("/nonexistent/path/sequence.yaml");
        assert!(matches!(result, Err(SequenceError::Io { .. })));
    }

    #[test]
    fn test_load_sequence_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "this is not valid yaml: [[[").unwrap();

        assert!(matches!(load_sequence(&path), Err(SequenceError::Yaml(_))));
    }

    #[test]
    fn test_load_sequence_rejects_schema_violation() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad_step.json");
        fs::write(
            &path,
            r#"{"metadata": {"name": "x"}, "steps": [{"id": "d", "kind": "Delay"}]}"#,
        )
        .unwrap();

        assert!(matches!(load_sequence(&path), Err(SequenceError::Invalid(_))));
    }

    #[test]
    fn test_save_and_load_json() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("example.json");

        let sequence = Sequence::example();
        save_sequence(&sequence, &path).unwrap();

        let loaded = load_sequence(&path).unwrap();
        assert_eq!(loaded, sequence);
    }

    #[test]
    fn test_save_creates_backup() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("seq.yaml");

        let first = Sequence::from_steps("first", vec![Step::delay(1.0)]);
        save_sequence(&first, &path).unwrap();

        let second = Sequence::from_steps("second", vec![Step::delay(2.0)]);
        save_sequence(&second, &path).unwrap();

        let backup = temp_dir.path().join("seq.yaml.bak");
        assert!(backup.exists());

        let backup_text = fs::read_to_string(&backup).unwrap();
        let parsed = parse_sequence(&backup_text, Format::Yaml).unwrap();
        assert_eq!(parsed.metadata.name, "first");
    }

    #[test]
    fn test_save_unsupported_extension() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("seq.txt");
        let result = save_sequence(&Sequence::example(), &path);
        assert!(matches!(result, Err(SequenceError::UnsupportedFormat(_))));
    }
}
