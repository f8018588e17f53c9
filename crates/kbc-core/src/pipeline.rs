//! Pipeline definition
//!
//! Built once from [`PipelineConfig`] at run start and read-only afterwards.
//! Query text and unit references are resolved into tagged variants here,
//! never re-parsed per record.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, PipelineConfig, RecordErrorPolicy, StageConfig, WriteMode};
use crate::{KbcError, Record, Result};

// ============================================================================
// Query and unit references
// ============================================================================

/// Input of a stage, passed verbatim to the storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuerySpec {
    /// Full scan of a named relation
    Relation(String),
    /// Opaque query text
    Text(String),
}

impl QuerySpec {
    /// Classify raw input text
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if is_identifier(trimmed) {
            Self::Relation(trimmed.to_string())
        } else {
            Self::Text(raw.to_string())
        }
    }

    /// The text as written
    pub fn as_text(&self) -> &str {
        match self {
            Self::Relation(name) => name,
            Self::Text(text) => text,
        }
    }
}

impl std::fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_text())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Handle to a processing unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitRef {
    /// In-process function registered under a name
    Builtin(String),
    /// External executable speaking the line protocol
    Command { program: String, args: Vec<String> },
}

impl UnitRef {
    pub const BUILTIN_PREFIX: &'static str = "builtin:";
}

impl std::str::FromStr for UnitRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix(Self::BUILTIN_PREFIX) {
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "udf".to_string(),
                    value: s.to_string(),
                });
            }
            return Ok(Self::Builtin(name.to_string()));
        }

        let mut parts = s.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| ConfigError::InvalidValue {
            key: "udf".to_string(),
            value: s.to_string(),
        })?;

        Ok(Self::Command {
            program,
            args: parts.collect(),
        })
    }
}

impl std::fmt::Display for UnitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin(name) => write!(f, "{}{}", Self::BUILTIN_PREFIX, name),
            Self::Command { program, args } if args.is_empty() => write!(f, "{program}"),
            Self::Command { program, args } => write!(f, "{} {}", program, args.join(" ")),
        }
    }
}

// ============================================================================
// Output shape
// ============================================================================

/// Declared shape every output record of a stage must satisfy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputShape {
    /// Fields that must be present (a `null` value counts as present)
    pub required: Vec<String>,
}

impl OutputShape {
    pub fn new(required: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    /// Check a record, passing it through on success
    pub fn validate(&self, record: Record) -> Result<Record> {
        match self.required.iter().find(|f| !record.contains(f)) {
            Some(missing) => Err(KbcError::record(format!(
                "output record is missing declared field `{missing}`"
            ))),
            None => Ok(record),
        }
    }
}

// ============================================================================
// Stage specification
// ============================================================================

/// One named unit of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name
    pub name: String,

    /// Input query
    pub input: QuerySpec,

    /// Destination relation
    pub output_relation: String,

    /// Processing unit
    pub unit: UnitRef,

    /// Declared dependencies (set semantics, first-occurrence order)
    pub dependencies: Vec<String>,

    /// Declared output shape
    pub output_shape: OutputShape,

    /// Malformed record handling
    pub record_policy: RecordErrorPolicy,

    /// How committed output lands
    pub write_mode: WriteMode,

    /// Processing unit deadline
    pub timeout: Option<Duration>,
}

impl StageSpec {
    /// Create a stage with default policies
    pub fn new(
        name: impl Into<String>,
        input: impl AsRef<str>,
        output_relation: impl Into<String>,
        unit: UnitRef,
    ) -> Self {
        Self {
            name: name.into(),
            input: QuerySpec::parse(input.as_ref()),
            output_relation: output_relation.into(),
            unit,
            dependencies: Vec::new(),
            output_shape: OutputShape::default(),
            record_policy: RecordErrorPolicy::default(),
            write_mode: WriteMode::default(),
            timeout: None,
        }
    }

    /// Set dependencies
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = dedup_names(deps.into_iter().map(Into::into));
        self
    }

    /// Set the declared output shape
    pub fn with_output_fields(
        mut self,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.output_shape = OutputShape::new(fields);
        self
    }

    /// Set the record error policy
    pub fn with_record_policy(mut self, policy: RecordErrorPolicy) -> Self {
        self.record_policy = policy;
        self
    }

    /// Set the write mode
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Set the unit deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn from_config(raw: &StageConfig, index: usize, defaults: RecordErrorPolicy) -> Result<Self> {
        let name = raw
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired(format!("stages[{index}].name")))?
            .to_string();

        let required = |value: &Option<String>, field: &str| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
                .ok_or_else(|| ConfigError::MissingRequired(format!("stages.{name}.{field}")))
        };

        let input = required(&raw.input, "input")?;
        let output_relation = required(&raw.output_relation, "output_relation")?;
        let unit: UnitRef = required(&raw.udf, "udf")?.parse()?;

        let mut spec = Self::new(name, input, output_relation.trim(), unit)
            .with_dependencies(raw.dependencies.iter().map(|d| d.trim().to_string()))
            .with_output_fields(raw.output_fields.iter().cloned())
            .with_record_policy(raw.on_record_error.unwrap_or(defaults))
            .with_write_mode(raw.write_mode);
        spec.timeout = raw.timeout_secs.map(Duration::from_secs);

        Ok(spec)
    }
}

fn dedup_names(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names.filter(|n| seen.insert(n.clone())).collect()
}

// ============================================================================
// Inference pass-through
// ============================================================================

/// Settings consumed only by the inference backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// Column -> variable role declarations
    pub variables: serde_json::Map<String, serde_json::Value>,

    /// Holdout fraction in `0.0..=1.0`
    pub holdout_fraction: f64,
}

// ============================================================================
// Pipeline definition
// ============================================================================

/// Immutable mapping from stage name to stage specification
#[derive(Debug, Clone, Default)]
pub struct PipelineDefinition {
    name: String,
    stages: Vec<StageSpec>,
    index: HashMap<String, usize>,
    inference: InferenceSettings,
}

impl PipelineDefinition {
    /// Build from stages in declaration order
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Result<Self> {
        let mut index = HashMap::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateStage(stage.name.clone()).into());
            }
        }

        Ok(Self {
            name: name.into(),
            stages,
            index,
            inference: InferenceSettings::default(),
        })
    }

    /// Build from a parsed configuration document
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let fraction = config.calibration.holdout_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::InvalidValue {
                key: "calibration.holdout_fraction".to_string(),
                value: fraction.to_string(),
            }
            .into());
        }

        let stages = config
            .stages
            .iter()
            .enumerate()
            .map(|(i, raw)| StageSpec::from_config(raw, i, config.runner.record_error_policy))
            .collect::<Result<Vec<_>>>()?;

        let mut definition = Self::new(config.pipeline.name.clone(), stages)?;
        definition.inference = InferenceSettings {
            variables: config.schema.variables.clone(),
            holdout_fraction: fraction,
        };
        Ok(definition)
    }

    /// Attach inference settings
    pub fn with_inference(mut self, inference: InferenceSettings) -> Self {
        self.inference = inference;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages in declaration order
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Look up a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Declaration position of a stage
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn inference(&self) -> &InferenceSettings {
        &self.inference
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn test_query_spec_classification() {
        assert_eq!(
            QuerySpec::parse("sentences"),
            QuerySpec::Relation("sentences".to_string())
        );
        assert_eq!(
            QuerySpec::parse("  public.sentences "),
            QuerySpec::Relation("public.sentences".to_string())
        );

        let text = "SELECT s.sentence_id FROM sentences s";
        assert_eq!(QuerySpec::parse(text), QuerySpec::Text(text.to_string()));
        assert_eq!(QuerySpec::parse(text).as_text(), text);
    }

    #[test]
    fn test_unit_ref_parse() {
        assert_eq!(
            "builtin:extract_people".parse::<UnitRef>().unwrap(),
            UnitRef::Builtin("extract_people".to_string())
        );
        assert_eq!(
            "python3 udf/ext_people.py --strict".parse::<UnitRef>().unwrap(),
            UnitRef::Command {
                program: "python3".to_string(),
                args: vec!["udf/ext_people.py".to_string(), "--strict".to_string()],
            }
        );
        assert!("builtin:".parse::<UnitRef>().is_err());
        assert!("   ".parse::<UnitRef>().is_err());
    }

    #[test]
    fn test_output_shape() {
        let shape = OutputShape::new(["mention_id", "text"]);
        let ok = Record::new()
            .with_field("mention_id", "s1_0")
            .with_field("text", serde_json::Value::Null);
        assert!(shape.validate(ok).is_ok());

        let missing = Record::new().with_field("mention_id", "s1_0");
        assert!(shape.validate(missing).unwrap_err().is_record_error());
    }

    #[test]
    fn test_dependencies_are_a_set() {
        let stage = StageSpec::new("b", "r", "out", UnitRef::Builtin("f".to_string()))
            .with_dependencies(["a", "c", "a"]);
        assert_eq!(stage.dependencies, vec!["a", "c"]);
    }

    #[test]
    fn test_from_config_missing_field() {
        let config = PipelineConfig::from_toml_str(
            r#"
[[stages]]
name = "clean"
input = "sentences_raw"
udf = "builtin:clean_sentences"
"#,
        )
        .unwrap();

        let err = PipelineDefinition::from_config(&config).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("stages.clean.output_relation"));
    }

    #[test]
    fn test_from_config_duplicate_stage() {
        let config = PipelineConfig::from_toml_str(
            r#"
[[stages]]
name = "a"
input = "r"
output_relation = "x"
udf = "builtin:f"

[[stages]]
name = "a"
input = "r"
output_relation = "y"
udf = "builtin:f"
"#,
        )
        .unwrap();

        let err = PipelineDefinition::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            KbcError::Config(ConfigError::DuplicateStage(ref n)) if n == "a"
        ));
    }

    #[test]
    fn test_from_config_holdout_range() {
        let mut config = PipelineConfig::default();
        config.calibration.holdout_fraction = 1.5;
        assert!(PipelineDefinition::from_config(&config)
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_from_config_resolves_policies() {
        let config = PipelineConfig::from_toml_str(
            r#"
[runner]
record_error_policy = "abort"

[[stages]]
name = "a"
input = "r"
output_relation = "x"
udf = "builtin:f"
timeout_secs = 5

[[stages]]
name = "b"
input = "x"
output_relation = "y"
udf = "sh ./b.sh"
on_record_error = "skip"
dependencies = ["a"]

[calibration]
holdout_fraction = 0.1
"#,
        )
        .unwrap();

        let def = PipelineDefinition::from_config(&config).unwrap();
        let a = def.stage("a").unwrap();
        let b = def.stage("b").unwrap();
        assert_eq!(a.record_policy, RecordErrorPolicy::Abort);
        assert_eq!(a.timeout, Some(Duration::from_secs(5)));
        assert_eq!(b.record_policy, RecordErrorPolicy::Skip);
        assert_eq!(def.position("b"), Some(1));
        assert_eq!(def.inference().holdout_fraction, 0.1);
    }
}
