//! KBC Pipeline - Stage orchestration
//!
//! This crate turns a [`PipelineDefinition`] into an executed run:
//! - Dependency resolution into a deterministic execution plan
//! - The streaming transform protocol for in-process and external units
//! - Single-stage execution with transactional output
//! - Run coordination with partial-failure semantics
//! - Reporting of the resulting run summary

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kbc_core::{ConfigError, PipelineDefinition, RecordFunction, Result, UnitRef};

pub mod coordinator;
pub mod executor;
pub mod process;
pub mod protocol;
pub mod report;
pub mod resolver;

pub use coordinator::{RunCoordinator, RunOptions};
pub use executor::StageExecutor;
pub use process::ProcessUnit;
pub use protocol::{FunctionUnit, ProcessingUnit, UnitChannel, UnitContext};
pub use report::{JsonReporter, RunReporter, TextReporter, TracingReporter};
pub use resolver::{resolve, resolve_graph, ExecutionPlan};

// ============================================================================
// Function registry
// ============================================================================

/// In-process functions addressable as `builtin:<name>`
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn RecordFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under its own name, replacing any previous one
    pub fn register(&mut self, function: Arc<dyn RecordFunction>) -> &mut Self {
        self.functions.insert(function.name().to_string(), function);
        self
    }

    pub fn register_all(&mut self, functions: impl IntoIterator<Item = Arc<dyn RecordFunction>>) {
        for function in functions {
            self.register(function);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RecordFunction>> {
        self.functions.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ============================================================================
// Runnable pipeline
// ============================================================================

/// A definition with every unit reference resolved
pub struct Pipeline {
    definition: PipelineDefinition,
    units: HashMap<String, Arc<dyn ProcessingUnit>>,
}

impl Pipeline {
    /// Resolve each stage's unit once: builtins through the registry,
    /// commands into external processes run from `working_dir`.
    pub fn build(
        definition: PipelineDefinition,
        registry: &FunctionRegistry,
        working_dir: Option<&Path>,
    ) -> Result<Self> {
        let mut units: HashMap<String, Arc<dyn ProcessingUnit>> = HashMap::new();

        for stage in definition.stages() {
            let unit: Arc<dyn ProcessingUnit> = match &stage.unit {
                UnitRef::Builtin(name) => {
                    let function = registry.get(name).ok_or_else(|| ConfigError::UnknownUnit {
                        stage: stage.name.clone(),
                        unit: stage.unit.to_string(),
                    })?;
                    Arc::new(FunctionUnit::new(function))
                }
                UnitRef::Command { program, args } => {
                    let mut process = ProcessUnit::new(program, args.clone());
                    if let Some(dir) = working_dir {
                        process = process.with_working_dir(dir);
                    }
                    Arc::new(process)
                }
            };
            units.insert(stage.name.clone(), unit);
        }

        Ok(Self { definition, units })
    }

    /// Swap the unit of one stage
    pub fn with_unit(mut self, stage: &str, unit: Arc<dyn ProcessingUnit>) -> Result<Self> {
        if self.definition.stage(stage).is_none() {
            return Err(ConfigError::MissingRequired(format!("stage `{stage}`")).into());
        }
        self.units.insert(stage.to_string(), unit);
        Ok(self)
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn unit(&self, stage: &str) -> Option<Arc<dyn ProcessingUnit>> {
        self.units.get(stage).cloned()
    }
}

/// Directory external units run from when none is configured
pub fn default_working_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbc_core::{KbcError, Record, StageSpec};

    struct Identity;

    impl RecordFunction for Identity {
        fn apply(&self, record: &Record) -> Result<Vec<Record>> {
            Ok(vec![record.clone()])
        }

        fn name(&self) -> &str {
            "identity"
        }
    }

    fn definition(units: &[&str]) -> PipelineDefinition {
        let stages = units
            .iter()
            .enumerate()
            .map(|(i, u)| StageSpec::new(format!("s{i}"), "in", "out", u.parse().unwrap()))
            .collect();
        PipelineDefinition::new("test", stages).unwrap()
    }

    #[test]
    fn test_build_resolves_units() {
        let mut registry = FunctionRegistry::new();
        registry.register(Arc::new(Identity));

        let pipeline = Pipeline::build(
            definition(&["builtin:identity", "python3 udf/ext.py"]),
            &registry,
            Some(Path::new("/tmp")),
        )
        .unwrap();

        assert_eq!(pipeline.unit("s0").unwrap().describe(), "builtin:identity");
        assert_eq!(pipeline.unit("s1").unwrap().describe(), "python3 udf/ext.py");
        assert!(pipeline.unit("s2").is_none());
    }

    #[test]
    fn test_unknown_builtin() {
        let registry = FunctionRegistry::new();
        let err = Pipeline::build(definition(&["builtin:nope"]), &registry, None)
            .err()
            .unwrap();

        assert!(err.is_configuration());
        assert!(matches!(err, KbcError::Config(ConfigError::UnknownUnit { .. })));
    }

    #[test]
    fn test_registry_names() {
        let mut registry = FunctionRegistry::new();
        registry.register(Arc::new(Identity)).register(Arc::new(Identity));
        assert_eq!(registry.names(), vec!["identity"]);
    }

    #[test]
    fn test_default_working_dir() {
        assert_eq!(
            default_working_dir(Path::new("demos/spouse/pipeline.toml")),
            PathBuf::from("demos/spouse")
        );
        assert_eq!(default_working_dir(Path::new("pipeline.toml")), PathBuf::from("."));
    }
}
