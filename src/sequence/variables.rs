//! Variable References
//!
//! String parameters may refer to sequence variables with `${name}`.
//! A parameter consisting of exactly one reference takes the variable's
//! value with its JSON type; otherwise the value is spliced into the text.

use std::collections::BTreeMap;

use serde_json::Value;

use super::operation::SchemaError;

/// Checks if a string contains variable syntax.
pub fn has_references(text: &str) -> bool {
    text.contains("${")
}

/// Extracts variable names referenced in a string, in order of appearance.
///
/// # Example
/// ```
/// use sequencer::sequence::variables::extract_reference_names;
///
/// let names = extract_reference_names("set ${magnet} to ${current}");
/// assert_eq!(names, vec!["magnet", "current"]);
/// ```
pub fn extract_reference_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                names.push(after[..end].trim().to_string());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }

    names
}

/// Resolves every reference in `value` against `variables`.
///
/// Non-string values are returned unchanged.
pub fn substitute(
    key: &str,
    value: &Value,
    variables: &BTreeMap<String, Value>,
) -> Result<Value, SchemaError> {
    let Value::String(text) = value else {
        return Ok(value.clone());
    };

    if !has_references(text) {
        return Ok(value.clone());
    }

    // A lone reference keeps the variable's type.
    let trimmed = text.trim();
    if trimmed.starts_with("${") && trimmed.find('}') == Some(trimmed.len() - 1) {
        let name = trimmed[2..trimmed.len() - 1].trim();
        return lookup(key, name, variables).cloned();
    }

    let mut output = String::with_capacity(text.len());
    let mut rest = text.as_str();

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| SchemaError::InvalidParameter {
            key: key.to_string(),
            reason: format!("unterminated variable reference in '{}'", text),
        })?;

        let name = after[..end].trim();
        match lookup(key, name, variables)? {
            Value::String(s) => output.push_str(s),
            other => output.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    output.push_str(rest);

    Ok(Value::String(output))
}

fn lookup<'a>(
    key: &str,
    name: &str,
    variables: &'a BTreeMap<String, Value>,
) -> Result<&'a Value, SchemaError> {
    variables
        .get(name)
        .ok_or_else(|| SchemaError::UndefinedVariable {
            key: key.to_string(),
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, Value> {
        let mut vars = BTreeMap::new();
        vars.insert("current".to_string(), Value::from(100.5));
        vars.insert("magnet".to_string(), Value::from("Magnet_Current_A"));
        vars
    }

    #[test]
    fn test_has_references() {
        assert!(has_references("${current}"));
        assert!(!has_references("{current}"));
        assert!(!has_references("plain"));
    }

    #[test]
    fn test_extract_reference_names_unterminated() {
        assert_eq!(extract_reference_names("${a} and ${b"), vec!["a"]);
    }

    #[test]
    fn test_lone_reference_keeps_type() {
        let value = substitute("value", &Value::from("${current}"), &vars()).unwrap();
        assert_eq!(value, Value::from(100.5));
    }

    #[test]
    fn test_reference_spliced_into_text() {
        let value = substitute("message", &Value::from("${magnet} at ${current} A"), &vars()).unwrap();
        assert_eq!(value, Value::from("Magnet_Current_A at 100.5 A"));
    }

    #[test]
    fn test_undefined_variable() {
        let result = substitute("value", &Value::from("${missing}"), &vars());
        assert!(matches!(
            result,
            Err(SchemaError::UndefinedVariable { ref name, .. }) if name == "missing"
        ));
    }

    #[test]
    fn test_unterminated_reference() {
        let result = substitute("message", &Value::from("x ${current"), &vars());
        assert!(result.is_err());
    }

    #[test]
    fn test_non_string_untouched() {
        let value = substitute("value", &Value::from(42), &vars()).unwrap();
        assert_eq!(value, Value::from(42));
    }
}
