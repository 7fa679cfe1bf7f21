//! Launching the external pipeline program.
//!
//! The pipeline is opaque to this core: its contract is a command line, an
//! environment, an exit code, captured output, and the manifest it writes
//! for itself. Two runner implementations exist: [`direct::ProcessRunner`]
//! spawns the pipeline as a child of this process; [`supervised::SupervisedRunner`]
//! delegates to a systemd scope that outlives the orchestrator.
//!
//! Captured output is always bounded before it reaches a job record, and a
//! timeout is a definite failure that terminates the process tree.

pub mod direct;
pub mod supervised;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::JobRequest;

pub use direct::ProcessRunner;
pub use supervised::SupervisedRunner;

// ─────────────────────────────────────────────────────────────────────────────
// Error types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from a pipeline invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The configured pipeline command is empty.
    #[error("pipeline command is empty")]
    EmptyCommand,

    /// The pipeline process could not be spawned or awaited.
    #[error("pipeline spawn failed: {context}: {source}")]
    Spawn {
        /// What was being attempted.
        context: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The pipeline exceeded its wall-clock budget and was terminated.
    #[error("Job timed out after {secs}s")]
    TimedOut {
        /// Budget that was exceeded, in seconds.
        secs: u64,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one pipeline invocation. `stdout`/`stderr` are already
/// bounded to the record caps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Process exit code; `-1` when unobtainable.
    pub exit_code: i32,
    /// Bounded captured stdout.
    pub stdout: String,
    /// Bounded captured stderr.
    pub stderr: String,
}

/// Abstraction over launching the pipeline.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Run the pipeline for one job and capture its outcome.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::TimedOut` on budget expiry (the process tree is
    /// terminated first) and `RunnerError::Spawn` when the process cannot be
    /// started or awaited.
    async fn run(
        &self,
        request: &JobRequest,
        tenant_id: &str,
        loan_id: &str,
        env: &[(String, String)],
        timeout_secs: u64,
        job_id: &str,
    ) -> Result<RunOutput, RunnerError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Command and environment construction
// ─────────────────────────────────────────────────────────────────────────────

/// Build the full pipeline command line: configured program plus arguments
/// derived from the request. Typed booleans become flags only here.
#[must_use]
pub fn build_pipeline_command(
    pipeline_command: &[String],
    request: &JobRequest,
    tenant_id: &str,
    loan_id: &str,
) -> Vec<String> {
    let mut cmd: Vec<String> = pipeline_command.to_vec();
    cmd.push("--tenant-id".into());
    cmd.push(tenant_id.into());
    cmd.push("--loan-id".into());
    cmd.push(loan_id.into());
    if let Some(run_id) = &request.run_id {
        cmd.push("--run-id".into());
        cmd.push(run_id.clone());
    }
    if request.skip_intake {
        cmd.push("--skip-intake".into());
    }
    if request.skip_process {
        cmd.push("--skip-process".into());
    }
    if let Some(source_path) = &request.source_path {
        cmd.push("--source-path".into());
        cmd.push(source_path.clone());
    }
    if request.smoke_debug {
        cmd.push("--debug".into());
    }
    match request.run_llm {
        Some(true) => cmd.push("--run-llm".into()),
        Some(false) => cmd.push("--no-run-llm".into()),
        None => {},
    }
    if request.expect_rp_hash_stable == Some(true) {
        cmd.push("--expect-rp-hash-stable".into());
    }
    if let Some(max_dropped) = request.max_dropped_chunks {
        cmd.push("--max-dropped-chunks".into());
        cmd.push(max_dropped.to_string());
    }
    if request.offline_embeddings {
        cmd.push("--offline-embeddings".into());
    }
    if let Some(top_k) = request.top_k {
        cmd.push("--top-k".into());
        cmd.push(top_k.to_string());
    }
    if let Some(max_per_file) = request.max_per_file {
        cmd.push("--max-per-file".into());
        cmd.push(max_per_file.to_string());
    }
    cmd
}

/// Environment variables for a pipeline invocation, derived from the
/// request. This is the only place booleans become `"1"/"0"` strings.
#[must_use]
pub fn job_env(request: &JobRequest) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = vec![
        ("PYTHONUNBUFFERED".into(), "1".into()),
        (
            "SMOKE_DEBUG".into(),
            if request.smoke_debug { "1" } else { "0" }.into(),
        ),
    ];
    if let Some(stable) = request.expect_rp_hash_stable {
        env.push((
            "EXPECT_RP_HASH_STABLE".into(),
            if stable { "1" } else { "0" }.into(),
        ));
    }
    if let Some(max_dropped) = request.max_dropped_chunks {
        env.push(("MAX_DROPPED_CHUNKS".into(), max_dropped.to_string()));
    }
    if let Some(run_llm) = request.run_llm {
        env.push(("RUN_LLM".into(), if run_llm { "1" } else { "0" }.into()));
    }
    env
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn base_command() -> Vec<String> {
        vec!["python3".into(), "scripts/run_loan_job.py".into()]
    }

    #[test]
    fn command_always_carries_scope() {
        let cmd = build_pipeline_command(&base_command(), &JobRequest::default(), "t1", "L1");
        assert_eq!(
            cmd,
            vec![
                "python3",
                "scripts/run_loan_job.py",
                "--tenant-id",
                "t1",
                "--loan-id",
                "L1"
            ]
        );
    }

    #[test]
    fn command_maps_request_flags() {
        let req = JobRequest {
            run_id: Some("R1".into()),
            skip_intake: true,
            smoke_debug: true,
            run_llm: Some(false),
            expect_rp_hash_stable: Some(true),
            max_dropped_chunks: Some(3),
            top_k: Some(80),
            ..JobRequest::default()
        };
        let cmd = build_pipeline_command(&base_command(), &req, "t1", "L1");
        let joined = cmd.join(" ");
        assert!(joined.contains("--run-id R1"));
        assert!(joined.contains("--skip-intake"));
        assert!(joined.contains("--debug"));
        assert!(joined.contains("--no-run-llm"));
        assert!(joined.contains("--expect-rp-hash-stable"));
        assert!(joined.contains("--max-dropped-chunks 3"));
        assert!(joined.contains("--top-k 80"));
        assert!(!joined.contains("--skip-process"));
    }

    #[test]
    fn env_translates_booleans_at_the_boundary() {
        let req = JobRequest {
            smoke_debug: true,
            run_llm: Some(true),
            expect_rp_hash_stable: Some(false),
            max_dropped_chunks: Some(5),
            ..JobRequest::default()
        };
        let env = job_env(&req);
        let get = |k: &str| {
            env.iter()
                .find(|(name, _)| name == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("SMOKE_DEBUG"), Some("1"));
        assert_eq!(get("RUN_LLM"), Some("1"));
        assert_eq!(get("EXPECT_RP_HASH_STABLE"), Some("0"));
        assert_eq!(get("MAX_DROPPED_CHUNKS"), Some("5"));
    }

    #[test]
    fn env_omits_unset_options() {
        let env = job_env(&JobRequest::default());
        assert!(env.iter().all(|(name, _)| name != "RUN_LLM"));
        assert!(env.iter().all(|(name, _)| name != "MAX_DROPPED_CHUNKS"));
        assert!(env.iter().any(|(name, _)| name == "SMOKE_DEBUG"));
    }
}
