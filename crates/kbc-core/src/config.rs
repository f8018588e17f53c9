//! KBC Configuration Management
//!
//! Loads the declarative pipeline document (TOML) and applies
//! environment overrides, with sensible defaults for local runs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main pipeline configuration document
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipeline identity
    pub pipeline: PipelineSection,

    /// Stage declarations, in declaration order
    pub stages: Vec<StageConfig>,

    /// Variable declarations for the inference backend
    pub schema: SchemaConfig,

    /// Calibration settings for the inference backend
    pub calibration: CalibrationConfig,

    /// Run coordinator settings
    pub runner: RunnerConfig,

    /// Storage backend selection
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup("KBC_CONCURRENCY") {
            self.runner.concurrency = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "KBC_CONCURRENCY".to_string(),
                value,
            })?;
        }
        if let Some(value) = lookup("KBC_FAILURE_POLICY") {
            self.runner.failure_policy = value.parse()?;
        }
        if let Some(value) = lookup("KBC_RECORD_ERROR_POLICY") {
            self.runner.record_error_policy = value.parse()?;
        }
        if let Some(value) = lookup("KBC_STORAGE_PATH") {
            self.storage.path = PathBuf::from(value);
        }
        if let Some(value) = lookup("KBC_LOG_LEVEL") {
            self.logging.level = value;
        }

        Ok(self)
    }
}

/// Pipeline identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Pipeline name (reported in the run summary)
    pub name: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
        }
    }
}

/// One stage as written in the configuration document
///
/// Required fields are optional here so that a missing one is reported
/// as a configuration error naming the stage, not as a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StageConfig {
    /// Unique stage name
    pub name: Option<String>,

    /// Relation name or opaque query text
    pub input: Option<String>,

    /// Destination relation
    pub output_relation: Option<String>,

    /// Processing unit reference (`builtin:<name>` or a command line)
    pub udf: Option<String>,

    /// Names of stages that must succeed first
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Fields every output record must carry
    #[serde(default)]
    pub output_fields: Vec<String>,

    /// Per-stage override of the record error policy
    pub on_record_error: Option<RecordErrorPolicy>,

    /// How committed output lands in the relation
    #[serde(default)]
    pub write_mode: WriteMode,

    /// Kill the processing unit after this many seconds
    pub timeout_secs: Option<u64>,
}

/// Variable declarations (opaque to the runner)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchemaConfig {
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// Calibration settings (opaque to the runner apart from the range check)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Fraction of labeled data withheld for evaluation
    pub holdout_fraction: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.0,
        }
    }
}

/// Run coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of stages running at once
    pub concurrency: usize,

    /// What a failed stage does to the rest of the run
    pub failure_policy: FailurePolicy,

    /// Default policy for malformed records
    pub record_error_policy: RecordErrorPolicy,

    /// Output records per storage write
    pub batch_size: usize,

    /// Bound on in-flight records between executor and unit
    pub channel_capacity: usize,

    /// Working directory for external processing units
    pub working_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            failure_policy: FailurePolicy::Continue,
            record_error_policy: RecordErrorPolicy::Skip,
            batch_size: 1000,
            channel_capacity: 256,
            working_dir: None,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,

    /// Data directory for file-backed storage
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Jsonl,
            path: PathBuf::from("data"),
        }
    }
}

/// Supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Jsonl,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

// ============================================================================
// Policies
// ============================================================================

/// Handling of a malformed individual record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordErrorPolicy {
    /// Log and continue the stage
    #[default]
    Skip,
    /// Fail the whole stage
    Abort,
}

impl std::str::FromStr for RecordErrorPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            _ => Err(ConfigError::InvalidValue {
                key: "record_error_policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Handling of a failed stage at run level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Skip dependents, keep running unrelated branches
    #[default]
    Continue,
    /// Cancel in-flight stages and skip everything pending
    Abort,
}

impl std::str::FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "abort" => Ok(Self::Abort),
            _ => Err(ConfigError::InvalidValue {
                key: "failure_policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// How a stage's committed output lands in its relation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Replace the relation contents
    #[default]
    Replace,
    /// Append to existing contents
    Append,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Stage `{stage}` references unknown processing unit `{unit}`")]
    UnknownUnit { stage: String, unit: String },
}
