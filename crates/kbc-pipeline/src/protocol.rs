//! Streaming transform protocol
//!
//! A processing unit is opened into a [`UnitChannel`]: records are fed
//! through the input side one at a time, produced records (or per-record
//! errors) are drained from the output side, and the completion handle
//! reports how the unit terminated. Dropping the input sender signals end
//! of input.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kbc_core::{KbcError, Record, RecordFunction, Result};

/// Per-invocation settings handed to a unit when it is opened
#[derive(Debug, Clone)]
pub struct UnitContext {
    /// Owning stage, used for diagnostics
    pub stage: String,
    /// Bound of the input and output queues
    pub capacity: usize,
    /// Fires when the invocation must stop
    pub cancel: CancellationToken,
}

impl UnitContext {
    pub fn new(stage: impl Into<String>, capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            stage: stage.into(),
            capacity: capacity.max(1),
            cancel,
        }
    }
}

/// Open bidirectional channel to a running unit
pub struct UnitChannel {
    input: Option<mpsc::Sender<Record>>,
    output: mpsc::Receiver<Result<Record>>,
    completion: JoinHandle<Result<()>>,
}

impl UnitChannel {
    pub fn new(
        input: mpsc::Sender<Record>,
        output: mpsc::Receiver<Result<Record>>,
        completion: JoinHandle<Result<()>>,
    ) -> Self {
        Self {
            input: Some(input),
            output,
            completion,
        }
    }

    /// Hand the input side to a feeder. Dropping it ends the input.
    pub fn take_input(&mut self) -> Option<mpsc::Sender<Record>> {
        self.input.take()
    }

    /// Next produced record; `None` once the unit has flushed everything
    pub async fn next_output(&mut self) -> Option<Result<Record>> {
        self.output.recv().await
    }

    /// Refuse further output; pending and future sends by the unit fail
    pub fn stop_output(&mut self) {
        self.output.close();
    }

    /// Signal end of input and wait for the unit to terminate
    pub async fn close(mut self) -> Result<()> {
        self.input.take();
        self.output.close();
        match self.completion.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(KbcError::Cancelled("unit task aborted".into())),
            Err(e) => Err(KbcError::unit(format!("unit task panicked: {e}"))),
        }
    }
}

/// Anything that can transform a record stream under the channel lifecycle
#[async_trait]
pub trait ProcessingUnit: Send + Sync {
    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// Start an invocation
    async fn open(&self, ctx: UnitContext) -> Result<UnitChannel>;
}

// ============================================================================
// In-process units
// ============================================================================

/// Runs a [`RecordFunction`] on a task, one record at a time
#[derive(Clone)]
pub struct FunctionUnit {
    function: Arc<dyn RecordFunction>,
}

impl FunctionUnit {
    pub fn new(function: Arc<dyn RecordFunction>) -> Self {
        Self { function }
    }
}

#[async_trait]
impl ProcessingUnit for FunctionUnit {
    fn describe(&self) -> String {
        format!("builtin:{}", self.function.name())
    }

    async fn open(&self, ctx: UnitContext) -> Result<UnitChannel> {
        let (input_tx, mut input_rx) = mpsc::channel::<Record>(ctx.capacity);
        let (output_tx, output_rx) = mpsc::channel(ctx.capacity);
        let function = Arc::clone(&self.function);
        let cancel = ctx.cancel;
        let stage = ctx.stage;

        let completion = tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(KbcError::Cancelled(format!("stage `{stage}` was cancelled")));
                    }
                    record = input_rx.recv() => record,
                };
                let Some(record) = record else { break };

                let produced: Vec<Result<Record>> = match function.apply(&record) {
                    Ok(records) => records.into_iter().map(Ok).collect(),
                    Err(e) if e.is_record_error() => vec![Err(e)],
                    Err(e) => return Err(e),
                };
                for item in produced {
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(KbcError::Cancelled(format!(
                                "stage `{stage}` was cancelled"
                            )));
                        }
                        sent = output_tx.send(item) => sent,
                    };
                    if sent.is_err() {
                        // Consumer went away; nothing left to deliver to
                        return Ok(());
                    }
                }
            }
            Ok(())
        });

        Ok(UnitChannel::new(input_tx, output_rx, completion))
    }
}
