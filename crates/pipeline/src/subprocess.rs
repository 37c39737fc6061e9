use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use crate::error::{PipelineError, PipelineResult};

/// Number of trailing stderr lines kept for error messages
const STDERR_TAIL: usize = 5;

/// Spawn `program` and stream its output until it exits.
///
/// Every stdout line is logged and handed to `on_stdout`; stderr goes to the log only.
/// Both pipes are drained on their own tasks so a full buffer cannot stall the child.
/// A non-zero exit, a failed spawn and an expired timeout are all `Subprocess` errors.
pub async fn run_streaming<F>(
    tool: &str,
    program: &Path,
    args: &[String],
    time_limit: Option<Duration>,
    mut on_stdout: F,
) -> PipelineResult<()>
where
    F: FnMut(&str) + Send + 'static,
{
    let program_name = program.display().to_string();
    debug!("Executing {}: {} {}", tool, program_name, args.join(" "));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        PipelineError::subprocess(&program_name, format!("failed to start {}: {}", tool, e))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::subprocess(&program_name, "failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| PipelineError::subprocess(&program_name, "failed to capture stderr"))?;

    let stdout_tool = tool.to_string();
    let stdout_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!("[{} stdout]: {}", stdout_tool, line);
                    on_stdout(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading {} stdout: {}", stdout_tool, e);
                    break;
                }
            }
        }
    });

    let stderr_tool = tool.to_string();
    let stderr_handle = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!("[{} stderr]: {}", stderr_tool, line);
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading {} stderr: {}", stderr_tool, e);
                    break;
                }
            }
        }
        tail.into_iter().collect::<Vec<_>>()
    });

    let status = match time_limit {
        Some(limit) => match timeout(limit, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill stuck {} process: {}", tool, e);
                }
                stdout_handle.abort();
                stderr_handle.abort();
                return Err(PipelineError::subprocess(
                    &program_name,
                    format!("{} timed out after {} seconds and was killed", tool, limit.as_secs()),
                ));
            }
        },
        None => child.wait().await,
    }
    .map_err(|e| PipelineError::subprocess(&program_name, format!("failed to wait for {}: {}", tool, e)))?;

    // Pipes close when the child exits; finish draining before judging the result
    if let Err(e) = stdout_handle.await {
        warn!("{} stdout reader ended abnormally: {}", tool, e);
    }
    let stderr_tail = stderr_handle.await.unwrap_or_default();

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let mut detail = format!("{} exited with status {}", tool, code);
        if let Some(last) = stderr_tail.last() {
            detail.push_str(": ");
            detail.push_str(last);
        }
        return Err(PipelineError::subprocess(&program_name, detail));
    }

    debug!("{} completed successfully", tool);
    Ok(())
}
