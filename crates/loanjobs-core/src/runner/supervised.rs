//! Supervised runner: the pipeline executes inside a transient systemd
//! scope and survives an orchestrator restart.
//!
//! The scope runs a small shell wrapper that redirects the pipeline's
//! output to artifact files and writes the real exit code to an `rc` file.
//! Those artifacts are read back as the authoritative outcome; the local
//! `systemd-run --wait` status is not trusted, because the orchestrator may
//! have died and restarted mid-run.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{build_pipeline_command, PipelineRunner, RunOutput, RunnerError};
use crate::domain::JobRequest;
use crate::supervise::{JobSupervisor, SystemdSupervisor};

/// Runs the pipeline inside a systemd scope named after the job.
#[derive(Debug, Clone)]
pub struct SupervisedRunner {
    pipeline_command: Vec<String>,
    supervisor: SystemdSupervisor,
}

impl SupervisedRunner {
    /// Runner invoking `pipeline_command` under `supervisor`.
    #[must_use]
    pub fn new(pipeline_command: Vec<String>, supervisor: SystemdSupervisor) -> Self {
        Self {
            pipeline_command,
            supervisor,
        }
    }
}

#[async_trait]
impl PipelineRunner for SupervisedRunner {
    async fn run(
        &self,
        request: &JobRequest,
        tenant_id: &str,
        loan_id: &str,
        env: &[(String, String)],
        timeout_secs: u64,
        job_id: &str,
    ) -> Result<RunOutput, RunnerError> {
        let cmd = build_pipeline_command(&self.pipeline_command, request, tenant_id, loan_id);
        if cmd.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }

        // A fresh job id should have no artifacts; remove leftovers anyway.
        self.supervisor.cleanup(job_id);

        let unit = self.supervisor.unit_name(job_id);
        let script = scope_script(&cmd, &self.supervisor, job_id);
        let mut child = tokio::process::Command::new("systemd-run")
            .arg("--scope")
            .arg("--wait")
            .arg(format!("--unit={unit}"))
            .arg("--property=KillMode=process")
            .arg("--property=TimeoutStopSec=20")
            .arg("--")
            .arg("/bin/sh")
            .arg("-c")
            .arg(&script)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RunnerError::Spawn {
                context: format!("spawning systemd-run for unit {unit}"),
                source: e,
            })?;

        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => {
                return Err(RunnerError::Spawn {
                    context: format!("waiting for unit {unit}"),
                    source: e,
                });
            },
            Err(_) => {
                let _ = child.kill().await;
                stop_unit(&unit);
                self.supervisor.cleanup(job_id);
                return Err(RunnerError::TimedOut { secs: timeout_secs });
            },
        }

        let output = self.supervisor.read_final_output(job_id);
        self.supervisor.cleanup(job_id);
        Ok(RunOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Shell wrapper executed inside the scope: run the pipeline with output
/// redirected to the artifact files, then record its exit code.
fn scope_script(cmd: &[String], supervisor: &SystemdSupervisor, job_id: &str) -> String {
    let quoted: Vec<String> = cmd.iter().map(|part| shell_quote(part)).collect();
    format!(
        "{} >{} 2>{}; echo $? >{}",
        quoted.join(" "),
        shell_quote(&supervisor.stdout_file(job_id).to_string_lossy()),
        shell_quote(&supervisor.stderr_file(job_id).to_string_lossy()),
        shell_quote(&supervisor.rc_file(job_id).to_string_lossy()),
    )
}

/// Single-quote `s` for POSIX sh, escaping embedded single quotes.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Terminate a scope's whole process tree; best effort.
fn stop_unit(unit: &str) {
    let scope = format!("{unit}.scope");
    match std::process::Command::new("systemctl")
        .args(["stop", &scope])
        .status()
    {
        Ok(status) if status.success() => {},
        Ok(status) => warn!(unit = %scope, code = ?status.code(), "systemctl stop failed"),
        Err(e) => warn!(unit = %scope, error = %e, "systemctl stop failed"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
