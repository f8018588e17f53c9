//! KBC Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the pipeline runner:
//! - Records and tri-state labels
//! - Stage specifications and the pipeline definition
//! - Stage results and run summaries
//! - Common error types
//! - Collaborator traits for storage and in-process processing units
//! - Configuration management

pub mod config;
pub mod pipeline;
pub mod record;

pub use config::{
    ConfigError, FailurePolicy, LoggingConfig, PipelineConfig, RecordErrorPolicy, RunnerConfig,
    StorageConfig, StorageKind, WriteMode,
};
pub use pipeline::{
    InferenceSettings, OutputShape, PipelineDefinition, QuerySpec, StageSpec, UnitRef,
};
pub use record::{Label, Record};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for pipeline operations
#[derive(Error, Debug)]
pub enum KbcError {
    #[error("Unknown dependency: stage `{stage}` depends on undeclared stage `{missing}`")]
    UnknownDependency { stage: String, missing: String },

    #[error("Cyclic dependency: {}", format_cycle(.members))]
    CyclicDependency { members: Vec<String> },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record error: {0}")]
    RecordError(String),

    #[error("Processing unit failure: {0}")]
    UnitFailure(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KbcError>;

impl KbcError {
    pub fn record(message: impl Into<String>) -> Self {
        Self::RecordError(message.into())
    }

    pub fn unit(message: impl Into<String>) -> Self {
        Self::UnitFailure(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError(message.into())
    }

    /// Errors that abort a run before any stage executes
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownDependency { .. } | Self::CyclicDependency { .. } | Self::Config(_)
        )
    }

    /// Per-record errors, subject to the record error policy
    pub fn is_record_error(&self) -> bool {
        matches!(self, Self::RecordError(_))
    }
}

fn format_cycle(members: &[String]) -> String {
    match members.first() {
        Some(first) => format!("{} -> {}", members.join(" -> "), first),
        None => String::new(),
    }
}

// ============================================================================
// Stage and Run Results
// ============================================================================

/// Lifecycle state of a stage within one run
///
/// `pending -> running -> {success | failure}` or `pending -> skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Record counters of one stage execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    /// Records read from the input query
    pub records_in: u64,
    /// Records committed to the output relation
    pub records_out: u64,
    /// Malformed records dropped under the skip policy
    pub records_skipped: u64,
}

/// Outcome of one stage in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name
    pub stage: String,

    /// Terminal status
    pub status: StageStatus,

    /// Wall time spent running (zero for skipped stages)
    #[serde(rename = "elapsed_ms", with = "duration_ms")]
    pub elapsed: Duration,

    /// Human-readable reason for `failure` and `skipped`
    pub error: Option<String>,

    /// Record counters
    #[serde(flatten)]
    pub counts: StageCounts,
}

impl StageResult {
    pub fn success(stage: impl Into<String>, elapsed: Duration, counts: StageCounts) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Success,
            elapsed,
            error: None,
            counts,
        }
    }

    pub fn failure(
        stage: impl Into<String>,
        elapsed: Duration,
        error: impl std::fmt::Display,
        counts: StageCounts,
    ) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Failure,
            elapsed,
            error: Some(error.to_string()),
            counts,
        }
    }

    pub fn skipped(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Skipped,
            elapsed: Duration::ZERO,
            error: Some(reason.into()),
            counts: StageCounts::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }
}

/// Ordered outcome of a full pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run identifier
    pub run_id: Uuid,

    /// Pipeline name
    pub pipeline: String,

    /// Run start timestamp
    pub started_at: DateTime<Utc>,

    /// Total wall time
    #[serde(rename = "elapsed_ms", with = "duration_ms")]
    pub elapsed: Duration,

    /// One entry per stage, in resolved execution order
    pub stages: Vec<StageResult>,
}

impl RunSummary {
    /// Create an empty summary at run start
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            stages: Vec::new(),
        }
    }

    /// Look up a stage result
    pub fn get(&self, stage: &str) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// Status of a stage, if it is part of the run
    pub fn status(&self, stage: &str) -> Option<StageStatus> {
        self.get(stage).map(|r| r.status)
    }

    /// Stages that did not succeed
    pub fn failures(&self) -> impl Iterator<Item = &StageResult> {
        self.stages.iter().filter(|r| !r.is_success())
    }

    /// True if every stage succeeded
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(StageResult::is_success)
    }

    /// Count stages in a given status
    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|r| r.status == status).count()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Lazy, finite, non-restartable record sequence
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Relational storage collaborator
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Evaluate an input query
    async fn query(&self, query: &QuerySpec) -> Result<RecordStream>;

    /// Open a write transaction on a relation
    ///
    /// Nothing written through the transaction is visible before `commit`.
    async fn begin_append(
        &self,
        relation: &str,
        mode: WriteMode,
    ) -> Result<Box<dyn AppendTransaction>>;

    /// Append a batch of records in one transaction
    async fn append_records(&self, relation: &str, records: Vec<Record>) -> Result<u64> {
        let mut tx = self.begin_append(relation, WriteMode::Append).await?;
        tx.write(records).await?;
        tx.commit().await
    }

    /// Names of the relations currently stored
    async fn relation_names(&self) -> Result<Vec<String>>;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Pending output of one stage
#[async_trait::async_trait]
pub trait AppendTransaction: Send {
    /// Stage a batch of records
    async fn write(&mut self, records: Vec<Record>) -> Result<()>;

    /// Make staged records visible; returns the number committed
    async fn commit(self: Box<Self>) -> Result<u64>;

    /// Discard staged records
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// In-process processing unit: one input record in, zero or more out
///
/// Implementations return [`KbcError::RecordError`] for a malformed input
/// record; any other error is fatal to the stage.
pub trait RecordFunction: Send + Sync {
    fn apply(&self, record: &Record) -> Result<Vec<Record>>;

    /// Get function name for logging
    fn name(&self) -> &str;
}

// ============================================================================
// Tests
// ============================================================================
