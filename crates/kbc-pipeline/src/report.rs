//! Reporting collaborators
//!
//! The coordinator returns a [`RunSummary`]; reporters decide where it goes.

use std::io::Write;
use std::sync::Mutex;

use kbc_core::{KbcError, Result, RunSummary, StageStatus};

/// Receives the summary of a finished run
pub trait RunReporter: Send + Sync {
    fn report(&self, summary: &RunSummary) -> Result<()>;
}

/// Logs one event per stage
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl RunReporter for TracingReporter {
    fn report(&self, summary: &RunSummary) -> Result<()> {
        for stage in &summary.stages {
            let elapsed_ms = stage.elapsed.as_millis() as u64;
            let reason = stage.error.as_deref().unwrap_or("");
            match stage.status {
                StageStatus::Success => tracing::info!(
                    stage = %stage.stage,
                    elapsed_ms,
                    records_out = stage.counts.records_out,
                    "success"
                ),
                StageStatus::Failure => {
                    tracing::error!(stage = %stage.stage, elapsed_ms, "failure: {reason}")
                }
                status => tracing::warn!(stage = %stage.stage, "{status}: {reason}"),
            }
        }

        tracing::info!(
            run_id = %summary.run_id,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            success = summary.is_success(),
            "Run summary for `{}`",
            summary.pipeline
        );
        Ok(())
    }
}

/// Writes the summary as pretty-printed JSON
pub struct JsonReporter<W> {
    writer: Mutex<W>,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|_| KbcError::Other(anyhow::anyhow!("reporter writer poisoned")))
    }
}

impl<W: Write + Send> RunReporter for JsonReporter<W> {
    fn report(&self, summary: &RunSummary) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| KbcError::Other(anyhow::anyhow!("reporter writer poisoned")))?;

        serde_json::to_writer_pretty(&mut *writer, summary)
            .map_err(|e| KbcError::Other(e.into()))?;
        writeln!(writer).map_err(|e| KbcError::Other(e.into()))?;
        writer.flush().map_err(|e| KbcError::Other(e.into()))
    }
}

/// Plain-text table, one line per stage
pub struct TextReporter<W> {
    writer: Mutex<W>,
}

impl<W: Write> TextReporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|_| KbcError::Other(anyhow::anyhow!("reporter writer poisoned")))
    }
}

impl<W: Write + Send> RunReporter for TextReporter<W> {
    fn report(&self, summary: &RunSummary) -> Result<()> {
        let mut out = String::new();
        out.push_str(&format!("Pipeline: {} (run {})\n", summary.pipeline, summary.run_id));

        let width = summary
            .stages
            .iter()
            .map(|s| s.stage.len())
            .max()
            .unwrap_or(0)
            .max(5);

        for stage in &summary.stages {
            out.push_str(&format!(
                "  {:<width$}  {:<8} {:>8}ms",
                stage.stage,
                stage.status.to_string(),
                stage.elapsed.as_millis()
            ));
            if stage.status == StageStatus::Success {
                out.push_str(&format!(
                    "  in={} out={} skipped={}",
                    stage.counts.records_in, stage.counts.records_out, stage.counts.records_skipped
                ));
            }
            if let Some(reason) = &stage.error {
                out.push_str(&format!("  {reason}"));
            }
            out.push('\n');
        }

        out.push_str(&format!(
            "{} succeeded, {} failed, {} skipped in {:.2}s\n",
            summary.count(StageStatus::Success),
            summary.count(StageStatus::Failure),
            summary.count(StageStatus::Skipped),
            summary.elapsed.as_secs_f64()
        ));

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| KbcError::Other(anyhow::anyhow!("reporter writer poisoned")))?;
        writer
            .write_all(out.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| KbcError::Other(e.into()))
    }
}
