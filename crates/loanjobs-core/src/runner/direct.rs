//! Direct runner: the pipeline is a child of this process.
//!
//! Stdout and stderr are captured concurrently so a full pipe can never
//! deadlock the child. Timeout expiry kills the child before returning.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{build_pipeline_command, PipelineRunner, RunOutput, RunnerError};
use crate::domain::{truncate_output, JobRequest, STDERR_TRUNCATE, STDOUT_TRUNCATE};

/// Spawns the pipeline as a child process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    pipeline_command: Vec<String>,
}

impl ProcessRunner {
    /// Runner invoking `pipeline_command` (program plus leading arguments).
    #[must_use]
    pub fn new(pipeline_command: Vec<String>) -> Self {
        Self { pipeline_command }
    }
}

#[async_trait]
impl PipelineRunner for ProcessRunner {
    async fn run(
        &self,
        request: &JobRequest,
        tenant_id: &str,
        loan_id: &str,
        env: &[(String, String)],
        timeout_secs: u64,
        _job_id: &str,
    ) -> Result<RunOutput, RunnerError> {
        let cmd = build_pipeline_command(&self.pipeline_command, request, tenant_id, loan_id);
        let (program, args) = cmd.split_first().ok_or(RunnerError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn {
                context: format!("spawning {program}"),
                source: e,
            })?;

        // Drain both pipes concurrently with the wait.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(drain_pipe(stdout_pipe));
        let stderr_task = tokio::spawn(drain_pipe(stderr_pipe));

        let status = match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait())
            .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(RunnerError::Spawn {
                    context: "waiting for pipeline".to_string(),
                    source: e,
                });
            },
            Err(_) => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(RunnerError::TimedOut { secs: timeout_secs });
            },
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(RunOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: truncate_output(&stdout, STDOUT_TRUNCATE),
            stderr: truncate_output(&stderr, STDERR_TRUNCATE),
        })
    }
}

async fn drain_pipe<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
