//! Records and labels
//!
//! A [`Record`] is the unit exchanged between storage and processing units.
//! On the wire it is one JSON object per line; field order is irrelevant.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{KbcError, Result};

// ============================================================================
// Record
// ============================================================================

/// A self-describing data item: field name -> scalar or nested value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Add a field value
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Set a field value in place
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Get a field value
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Check whether a field is present (a present `null` counts)
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over field names
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Get a required string field
    pub fn require_str(&self, name: &str) -> Result<&str> {
        match self.0.get(name) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(KbcError::record(format!(
                "field `{name}` must be a string, got {}",
                type_name(other)
            ))),
            None => Err(KbcError::record(format!("missing required field `{name}`"))),
        }
    }

    /// Get a required array-of-strings field
    pub fn require_str_array(&self, name: &str) -> Result<Vec<&str>> {
        let values = match self.0.get(name) {
            Some(Value::Array(values)) => values,
            Some(other) => {
                return Err(KbcError::record(format!(
                    "field `{name}` must be an array, got {}",
                    type_name(other)
                )))
            }
            None => return Err(KbcError::record(format!("missing required field `{name}`"))),
        };

        values
            .iter()
            .map(|v| {
                v.as_str().ok_or_else(|| {
                    KbcError::record(format!("field `{name}` must contain only strings"))
                })
            })
            .collect()
    }

    /// Get an optional array-of-strings field
    pub fn optional_str_array(&self, name: &str) -> Result<Option<Vec<&str>>> {
        if self.0.contains_key(name) {
            self.require_str_array(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Get a required unsigned integer field
    pub fn require_u64(&self, name: &str) -> Result<u64> {
        match self.0.get(name) {
            Some(v) => v.as_u64().ok_or_else(|| {
                KbcError::record(format!(
                    "field `{name}` must be a non-negative integer, got {}",
                    type_name(v)
                ))
            }),
            None => Err(KbcError::record(format!("missing required field `{name}`"))),
        }
    }

    /// Decode one line of the wire format
    pub fn from_line(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| KbcError::record(format!("unparseable record: {e}")))?;

        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(KbcError::record(format!(
                "record must be a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Encode as one line of the wire format (no trailing newline)
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(&self.0)
            .map_err(|e| KbcError::record(format!("unencodable record: {e}")))
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = KbcError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(KbcError::record(format!(
                "record must be a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Label
// ============================================================================

/// Tri-state label of a relation candidate
///
/// `Unknown` is serialized as `null` and is distinct from `false`:
/// it marks a candidate the inference backend has to decide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum Label {
    True,
    False,
    #[default]
    Unknown,
}

impl From<Option<bool>> for Label {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Self::True,
            Some(false) => Self::False,
            None => Self::Unknown,
        }
    }
}

impl From<Label> for Option<bool> {
    fn from(label: Label) -> Self {
        match label {
            Label::True => Some(true),
            Label::False => Some(false),
            Label::Unknown => None,
        }
    }
}

impl From<Label> for Value {
    fn from(label: Label) -> Self {
        match Option::<bool>::from(label) {
            Some(b) => Value::Bool(b),
            None => Value::Null,
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_line_decoding_ignores_field_order() {
        let a = Record::from_line(r#"{"a":1,"b":"x"}"#).unwrap();
        let b = Record::from_line(r#"{"b":"x","a":1}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_line().unwrap(), b.to_line().unwrap());
    }

    #[test]
    fn test_non_object_line_is_record_error() {
        let err = Record::from_line("[1,2,3]").unwrap_err();
        assert!(err.is_record_error());

        let err = Record::from_line("not json").unwrap_err();
        assert!(err.is_record_error());
    }

    #[test]
    fn test_require_helpers() {
        let record = Record::new()
            .with_field("sentence_id", "s1")
            .with_field("words", json!(["Barack", "Obama"]))
            .with_field("start", 3);

        assert_eq!(record.require_str("sentence_id").unwrap(), "s1");
        assert_eq!(
            record.require_str_array("words").unwrap(),
            vec!["Barack", "Obama"]
        );
        assert_eq!(record.require_u64("start").unwrap(), 3);
        assert!(record.require_str("missing").is_err());
        assert!(record.require_str("start").is_err());
        assert!(record.optional_str_array("ner_tags").unwrap().is_none());
    }

    #[test]
    fn test_label_tri_state() {
        let record = Record::new()
            .with_field("t", Label::True)
            .with_field("f", Label::False)
            .with_field("u", Label::Unknown);

        let line = record.to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({"t": true, "f": false, "u": null}));
        assert!(record.contains("u"));

        let label: Label = serde_json::from_value(json!(null)).unwrap();
        assert_eq!(label, Label::Unknown);
        let label: Label = serde_json::from_value(json!(false)).unwrap();
        assert_eq!(label, Label::False);
    }
}
