//! Stage execution
//!
//! One stage: query the input, stream it through the unit, and write the
//! validated output into an append transaction. The transaction commits
//! only when the unit terminated cleanly, so a failed stage leaves its
//! output relation exactly as it was.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use kbc_core::{
    AppendTransaction, KbcError, Record, RecordErrorPolicy, RecordStream, Result, StageCounts,
    StageResult, StageSpec, StorageBackend,
};

use crate::protocol::{ProcessingUnit, UnitChannel, UnitContext};

/// Default number of output records per storage write
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default bound of the unit input/output queues
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Counters {
    records_in: AtomicU64,
    records_skipped: AtomicU64,
}

impl Counters {
    fn snapshot(&self, records_out: u64) -> StageCounts {
        StageCounts {
            records_in: self.records_in.load(Ordering::Relaxed),
            records_out,
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
        }
    }

    /// Apply the stage's policy to a malformed record
    fn record_error(&self, stage: &StageSpec, error: KbcError) -> Result<()> {
        match stage.record_policy {
            RecordErrorPolicy::Skip => {
                self.records_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(stage = %stage.name, "Skipping record: {error}");
                Ok(())
            }
            RecordErrorPolicy::Abort => Err(error),
        }
    }
}

/// Runs single stages against a storage backend
#[derive(Clone)]
pub struct StageExecutor {
    storage: Arc<dyn StorageBackend>,
    batch_size: usize,
    channel_capacity: usize,
}

impl StageExecutor {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Execute one stage and report its outcome. Never returns an error:
    /// every failure is folded into the `StageResult`.
    pub async fn execute(
        &self,
        stage: &StageSpec,
        unit: &dyn ProcessingUnit,
        cancel: &CancellationToken,
    ) -> StageResult {
        let span = tracing::info_span!("stage", name = %stage.name);

        async {
            let started = Instant::now();
            let token = cancel.child_token();
            let counters = Arc::new(Counters::default());

            tracing::info!(
                unit = %unit.describe(),
                output = %stage.output_relation,
                "Stage started"
            );

            let run = self.run(stage, unit, &token, &counters);
            let outcome = match stage.timeout {
                Some(limit) => tokio::time::timeout(limit, run)
                    .await
                    .unwrap_or_else(|_| Err(timed_out(limit))),
                None => run.await,
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(written) => {
                    let counts = counters.snapshot(written);
                    tracing::info!(
                        records_in = counts.records_in,
                        records_out = counts.records_out,
                        records_skipped = counts.records_skipped,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Stage succeeded"
                    );
                    StageResult::success(&stage.name, elapsed, counts)
                }
                Err(error) => {
                    // Stop whatever is still running on behalf of this stage
                    token.cancel();
                    let elapsed_ms = elapsed.as_millis() as u64;
                    tracing::warn!(elapsed_ms, "Stage failed: {error}");
                    StageResult::failure(&stage.name, elapsed, error, counters.snapshot(0))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        stage: &StageSpec,
        unit: &dyn ProcessingUnit,
        cancel: &CancellationToken,
        counters: &Arc<Counters>,
    ) -> Result<u64> {
        let input = self.storage.query(&stage.input).await?;

        let ctx = UnitContext::new(&stage.name, self.channel_capacity, cancel.clone());
        let mut channel = unit.open(ctx).await?;

        let mut tx = match self
            .storage
            .begin_append(&stage.output_relation, stage.write_mode)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                cancel.cancel();
                let _ = channel.close().await;
                return Err(e);
            }
        };

        let feeder = tokio::spawn(feed(
            input,
            channel.take_input(),
            stage.clone(),
            Arc::clone(counters),
            cancel.clone(),
        ));

        let drained = self.drain(stage, &mut channel, tx.as_mut(), counters, cancel).await;
        if drained.is_err() {
            // Nobody reads output past this point
            channel.stop_output();
            cancel.cancel();
        }

        let fed = match feeder.await {
            Ok(result) => result,
            Err(e) => Err(KbcError::unit(format!("input feeder failed: {e}"))),
        };
        let closed = channel.close().await;

        let outcome = drained.and(closed).and(fed);
        match outcome {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(abort_err) = tx.abort().await {
                    tracing::warn!("Discarding staged output failed: {abort_err}");
                }
                Err(e)
            }
        }
    }

    /// Collect unit output until it is exhausted, writing full batches
    async fn drain(
        &self,
        stage: &StageSpec,
        channel: &mut UnitChannel,
        tx: &mut dyn AppendTransaction,
        counters: &Counters,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut batch: Vec<Record> = Vec::with_capacity(self.batch_size);

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(&stage.name)),
                item = channel.next_output() => item,
            };
            let Some(item) = item else { break };

            match item.and_then(|record| stage.output_shape.validate(record)) {
                Ok(record) => {
                    batch.push(record);
                    if batch.len() >= self.batch_size {
                        let full = std::mem::take(&mut batch);
                        tracing::debug!(records = full.len(), "Writing batch");
                        tx.write(full).await?;
                    }
                }
                Err(e) if e.is_record_error() => counters.record_error(stage, e)?,
                Err(e) => return Err(e),
            }
        }

        if !batch.is_empty() {
            tracing::debug!(records = batch.len(), "Writing final batch");
            tx.write(batch).await?;
        }
        Ok(())
    }
}

/// Stream the input query into the unit; returning drops the sender,
/// which is the unit's end-of-input signal.
async fn feed(
    mut input: RecordStream,
    sink: Option<mpsc::Sender<Record>>,
    stage: StageSpec,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(sink) = sink else {
        return Err(KbcError::unit("unit input already taken"));
    };

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(&stage.name)),
            next = input.next() => next,
        };

        match next {
            None => return Ok(()),
            Some(Ok(record)) => {
                counters.records_in.fetch_add(1, Ordering::Relaxed);
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return Err(cancelled(&stage.name)),
                    sent = sink.send(record) => sent,
                };
                if sent.is_err() {
                    // The unit stopped reading; its completion says why
                    return Ok(());
                }
            }
            Some(Err(e)) if e.is_record_error() => counters.record_error(&stage, e)?,
            Some(Err(e)) => return Err(e),
        }
    }
}

fn cancelled(stage: &str) -> KbcError {
    KbcError::Cancelled(format!("stage `{stage}` was cancelled"))
}

fn timed_out(limit: Duration) -> KbcError {
    KbcError::unit(format!("timed out after {}s", limit.as_secs_f64()))
}
