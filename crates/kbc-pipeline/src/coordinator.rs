//! Run coordination
//!
//! Dispatches stages in plan order onto tokio tasks. A stage starts only
//! once every dependency reached `success`. A failed stage turns all of
//! its transitive dependents into `skipped`; unrelated branches continue
//! unless the failure policy is `abort`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use kbc_core::{
    FailurePolicy, Result, RunSummary, RunnerConfig, StageCounts, StageResult, StageStatus,
    StorageBackend,
};

use crate::executor::{StageExecutor, DEFAULT_BATCH_SIZE, DEFAULT_CHANNEL_CAPACITY};
use crate::resolver::{resolve, ExecutionPlan};
use crate::Pipeline;

/// Tunables of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Maximum number of stages running at once
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    pub batch_size: usize,
    pub channel_capacity: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            failure_policy: FailurePolicy::Continue,
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&RunnerConfig> for RunOptions {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            failure_policy: config.failure_policy,
            batch_size: config.batch_size.max(1),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

/// Executes a whole pipeline once per call to [`RunCoordinator::run`]
pub struct RunCoordinator {
    pipeline: Arc<Pipeline>,
    executor: Arc<StageExecutor>,
    options: RunOptions,
}

impl RunCoordinator {
    pub fn new(pipeline: Pipeline, storage: Arc<dyn StorageBackend>) -> Self {
        Self::with_options(pipeline, storage, RunOptions::default())
    }

    pub fn with_options(
        pipeline: Pipeline,
        storage: Arc<dyn StorageBackend>,
        options: RunOptions,
    ) -> Self {
        let executor = StageExecutor::new(storage)
            .with_batch_size(options.batch_size)
            .with_channel_capacity(options.channel_capacity);

        Self {
            pipeline: Arc::new(pipeline),
            executor: Arc::new(executor),
            options,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Resolve the execution plan without running anything
    pub fn plan(&self) -> Result<ExecutionPlan> {
        resolve(self.pipeline.definition())
    }

    /// Run every stage. Resolver errors abort before any stage executes;
    /// stage failures are reported in the summary.
    pub async fn run(&self) -> Result<RunSummary> {
        self.run_with_cancel(CancellationToken::new()).await
    }

    /// Run until done or until `cancel` fires. In-flight stages then fail
    /// as cancelled and stages that never started are skipped.
    pub async fn run_with_cancel(&self, cancel: CancellationToken) -> Result<RunSummary> {
        let plan = self.plan()?;
        let started = Instant::now();
        let mut summary = RunSummary::new(self.pipeline.definition().name());
        let run_token = cancel.child_token();

        tracing::info!(
            run_id = %summary.run_id,
            pipeline = %summary.pipeline,
            stages = plan.len(),
            concurrency = self.options.concurrency,
            "Run started"
        );

        let mut status: HashMap<String, StageStatus> = plan
            .order()
            .iter()
            .map(|s| (s.clone(), StageStatus::Pending))
            .collect();
        let mut results: HashMap<String, StageResult> = HashMap::new();
        let mut running: JoinSet<StageResult> = JoinSet::new();
        let mut abort_reason: Option<String> = None;

        loop {
            if abort_reason.is_none() && !run_token.is_cancelled() {
                self.launch_ready(&plan, &mut status, &mut running, &run_token);
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // Stage tasks catch their own panics; this only
                    // happens if the runtime is shutting down.
                    tracing::error!("Stage task lost: {e}");
                    abort_reason.get_or_insert_with(|| format!("stage task lost: {e}"));
                    run_token.cancel();
                    continue;
                }
            };

            status.insert(result.stage.clone(), result.status);

            if result.status == StageStatus::Failure {
                let failed = result.stage.clone();
                for dependent in plan.descendants(&failed) {
                    if status.get(&dependent) == Some(&StageStatus::Pending) {
                        tracing::warn!(stage = %dependent, upstream = %failed, "Skipping stage");
                        status.insert(dependent.clone(), StageStatus::Skipped);
                        let reason = format!("upstream stage `{failed}` failed");
                        results.insert(dependent.clone(), StageResult::skipped(dependent, reason));
                    }
                }

                if self.options.failure_policy == FailurePolicy::Abort && abort_reason.is_none() {
                    abort_reason = Some(format!("run aborted after stage `{failed}` failed"));
                    run_token.cancel();
                }
            }

            results.insert(result.stage.clone(), result);
        }

        let pending_reason = if let Some(reason) = abort_reason {
            reason
        } else if cancel.is_cancelled() {
            "run cancelled before the stage started".to_string()
        } else {
            "dependencies did not succeed".to_string()
        };

        summary.stages = plan
            .order()
            .iter()
            .map(|stage| {
                results
                    .remove(stage)
                    .unwrap_or_else(|| StageResult::skipped(stage, pending_reason.clone()))
            })
            .collect();
        summary.elapsed = started.elapsed();

        tracing::info!(
            run_id = %summary.run_id,
            succeeded = summary.count(StageStatus::Success),
            failed = summary.count(StageStatus::Failure),
            skipped = summary.count(StageStatus::Skipped),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Run finished"
        );

        Ok(summary)
    }

    /// Start pending stages whose dependencies all succeeded, in plan
    /// order, up to the concurrency limit
    fn launch_ready(
        &self,
        plan: &ExecutionPlan,
        status: &mut HashMap<String, StageStatus>,
        running: &mut JoinSet<StageResult>,
        token: &CancellationToken,
    ) {
        for name in plan.order() {
            if running.len() >= self.options.concurrency {
                break;
            }
            if status.get(name) != Some(&StageStatus::Pending) {
                continue;
            }
            let ready = plan
                .dependencies(name)
                .iter()
                .all(|d| status.get(d) == Some(&StageStatus::Success));
            if !ready {
                continue;
            }

            status.insert(name.clone(), StageStatus::Running);

            let (Some(stage), Some(unit)) = (
                self.pipeline.definition().stage(name).cloned(),
                self.pipeline.unit(name),
            ) else {
                let name = name.clone();
                running.spawn(async move {
                    let error = format!("no processing unit is bound to stage `{name}`");
                    StageResult::failure(name, Duration::ZERO, error, StageCounts::default())
                });
                continue;
            };

            let executor = Arc::clone(&self.executor);
            let token = token.clone();

            running.spawn(async move {
                let name = stage.name.clone();
                let execution = AssertUnwindSafe(executor.execute(&stage, unit.as_ref(), &token));
                match execution.catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => StageResult::failure(
                        name,
                        Duration::ZERO,
                        "stage task panicked",
                        StageCounts::default(),
                    ),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbc_core::{PipelineDefinition, StageSpec, UnitRef};
    use kbc_storage::MemoryStore;

    fn stage(name: &str, deps: &[&str]) -> StageSpec {
        StageSpec::new(name, "input", format!("{name}_out"), UnitRef::Builtin(name.into()))
            .with_dependencies(deps.iter().copied())
    }

    #[tokio::test]
    async fn test_unbound_stage_fails_and_skips_dependents() {
        let definition = PipelineDefinition::new(
            "unbound",
            vec![stage("first", &[]), stage("second", &["first"])],
        )
        .unwrap();
        let pipeline = Pipeline {
            definition,
            units: HashMap::new(),
        };
        let store = Arc::new(MemoryStore::new());

        let summary = RunCoordinator::new(pipeline, store).run().await.unwrap();

        let first = summary.get("first").unwrap();
        assert_eq!(first.status, StageStatus::Failure);
        assert!(first.error.as_deref().unwrap().contains("no processing unit"));
        let second = summary.get("second").unwrap();
        assert_eq!(second.status, StageStatus::Skipped);
        assert!(second.error.as_deref().unwrap().contains("`first`"));
    }
}
