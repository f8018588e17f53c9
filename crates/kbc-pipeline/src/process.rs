//! External-process units
//!
//! The child reads one JSON record per line on stdin and writes zero or
//! more JSON records per line on stdout. Whatever it prints on stderr is
//! forwarded to tracing under the `kbc::unit` target. Closing stdin is the
//! end-of-input signal.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use kbc_core::{KbcError, Record, Result};

use crate::protocol::{ProcessingUnit, UnitChannel, UnitContext};

/// Longest output line accepted from a unit
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Unit backed by an executable
#[derive(Debug, Clone)]
pub struct ProcessUnit {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ProcessUnit {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Run the executable from this directory
    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl ProcessingUnit for ProcessUnit {
    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn open(&self, ctx: UnitContext) -> Result<UnitChannel> {
        let description = self.describe();
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| KbcError::unit(format!("failed to start `{description}`: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            return Err(KbcError::unit(format!("`{description}` has no piped stdio")));
        };

        tracing::debug!(stage = %ctx.stage, pid = ?child.id(), unit = %description, "Unit started");

        let (input_tx, input_rx) = mpsc::channel(ctx.capacity);
        let (output_tx, output_rx) = mpsc::channel(ctx.capacity);

        let writer = tokio::spawn(write_records(stdin, input_rx));
        let reader = tokio::spawn(read_records(stdout, output_tx));
        let diagnostics = tokio::spawn(forward_diagnostics(stderr, ctx.stage.clone()));
        let cancel = ctx.cancel;
        let stage = ctx.stage;

        let completion = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.map_err(|e| {
                    KbcError::unit(format!("waiting for `{description}` failed: {e}"))
                })?,
                _ = cancel.cancelled() => {
                    writer.abort();
                    reader.abort();
                    if let Err(e) = child.kill().await {
                        tracing::warn!(stage = %stage, "Failed to kill unit: {e}");
                    }
                    return Err(KbcError::Cancelled(format!("stage `{stage}` was cancelled")));
                }
            };

            let written = join(writer).await;
            let read = join(reader).await;
            let _ = diagnostics.await;

            if !status.success() {
                return Err(KbcError::unit(format!("`{description}` exited with {status}")));
            }
            written?;
            read?;
            tracing::debug!(stage = %stage, "Unit exited cleanly");
            Ok(())
        });

        Ok(UnitChannel::new(input_tx, output_rx, completion))
    }
}

async fn join(task: JoinHandle<Result<()>>) -> Result<()> {
    task.await
        .map_err(|e| KbcError::unit(format!("unit I/O task failed: {e}")))?
}

async fn write_records(stdin: ChildStdin, mut input: mpsc::Receiver<Record>) -> Result<()> {
    let mut stdin = BufWriter::new(stdin);

    while let Some(record) = input.recv().await {
        let mut line = record.to_line()?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| KbcError::unit(format!("writing to unit stdin failed: {e}")))?;

        if input.is_empty() {
            stdin
                .flush()
                .await
                .map_err(|e| KbcError::unit(format!("flushing unit stdin failed: {e}")))?;
        }
    }

    stdin
        .shutdown()
        .await
        .map_err(|e| KbcError::unit(format!("closing unit stdin failed: {e}")))
}

async fn read_records(stdout: ChildStdout, output: mpsc::Sender<Result<Record>>) -> Result<()> {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut line_no = 0usize;

    while let Some(line) = lines.next().await {
        line_no += 1;
        let item = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => Record::from_line(&line)
                .map_err(|e| KbcError::record(format!("output line {line_no}: {e}"))),
            Err(LinesCodecError::MaxLineLengthExceeded) => Err(KbcError::record(format!(
                "output line {line_no} exceeds {MAX_LINE_BYTES} bytes"
            ))),
            Err(LinesCodecError::Io(e)) => {
                return Err(KbcError::unit(format!("reading unit stdout failed: {e}")));
            }
        };

        if output.send(item).await.is_err() {
            break;
        }
    }

    Ok(())
}

async fn forward_diagnostics(stderr: ChildStderr, stage: String) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => tracing::info!(target: "kbc::unit", stage = %stage, "{line}"),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(target: "kbc::unit", stage = %stage, "diagnostic line truncated");
            }
            Err(LinesCodecError::Io(_)) => break,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn sh(script: &str) -> ProcessUnit {
        ProcessUnit::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    async fn run(unit: &ProcessUnit, inputs: Vec<Record>) -> (Vec<Result<Record>>, Result<()>) {
        let ctx = UnitContext::new("test", 8, CancellationToken::new());
        let mut channel = unit.open(ctx).await.unwrap();
        let input = channel.take_input().unwrap();

        let feeder = tokio::spawn(async move {
            for record in inputs {
                if input.send(record).await.is_err() {
                    break;
                }
            }
        });

        let mut outputs = Vec::new();
        while let Some(item) = channel.next_output().await {
            outputs.push(item);
        }
        feeder.await.unwrap();
        (outputs, channel.close().await)
    }

    fn row(id: u64) -> Record {
        Record::new().with_field("id", id)
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (outputs, status) = run(&sh("cat"), vec![row(1), row(2), row(3)]).await;

        status.unwrap();
        let ids: Vec<u64> = outputs
            .into_iter()
            .map(|r| r.unwrap().require_u64("id").unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stderr_kept_out_of_records() {
        let unit = sh("echo 'loading dictionary' >&2; cat; echo done >&2");
        let (outputs, status) = run(&unit, vec![row(1)]).await;

        status.unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].is_ok());
    }

    #[tokio::test]
    async fn test_flush_at_end_of_input() {
        // Buffers everything and emits only after stdin closes
        let unit = sh("n=0; while read -r line; do n=$((n+1)); done; echo \"{\\\"count\\\":$n}\"");
        let (outputs, status) = run(&unit, vec![row(1), row(2)]).await;

        status.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].as_ref().unwrap().require_u64("count").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_malformed_line_is_record_error() {
        let unit = sh("cat >/dev/null; echo '{\"ok\":1}'; echo 'not json'; echo '[1,2]'");
        let (outputs, status) = run(&unit, vec![row(1)]).await;

        status.unwrap();
        assert_eq!(outputs.len(), 3);
        assert!(outputs[0].is_ok());
        assert!(outputs[1].as_ref().unwrap_err().is_record_error());
        assert!(outputs[2].as_ref().unwrap_err().is_record_error());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_unit_failure() {
        let (_, status) = run(&sh("cat >/dev/null; exit 3"), vec![row(1)]).await;
        assert!(matches!(status, Err(KbcError::UnitFailure(_))));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let unit = ProcessUnit::new("/nonexistent/kbc-unit", Vec::new());
        let ctx = UnitContext::new("test", 1, CancellationToken::new());
        assert!(matches!(unit.open(ctx).await, Err(KbcError::UnitFailure(_))));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let cancel = CancellationToken::new();
        let unit = sh("sleep 30");
        let mut channel = unit
            .open(UnitContext::new("test", 1, cancel.clone()))
            .await
            .unwrap();
        let _input = channel.take_input();

        let started = std::time::Instant::now();
        cancel.cancel();
        assert!(matches!(channel.close().await, Err(KbcError::Cancelled(_))));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let unit = sh("cat >/dev/null; test -f marker.txt && echo \"{\\\"tag\\\":\\\"$TAG\\\"}\"")
            .with_working_dir(dir.path())
            .with_env("TAG", "here");

        let (outputs, status) = run(&unit, vec![row(1)]).await;
        status.unwrap();
        assert_eq!(outputs[0].as_ref().unwrap().require_str("tag").unwrap(), "here");
    }
}
