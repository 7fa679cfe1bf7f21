//! OS-level process supervision for pipeline runs.
//!
//! A supervised run lives in its own systemd scope, so it keeps executing
//! when the orchestrating process restarts. The scope's shell redirects the
//! pipeline's output to temp files and records the real exit code in an
//! `rc` file; those artifacts, not the orchestrator's own `wait`, are the
//! authority on the run's outcome. Orphan reconciliation depends only on
//! the [`JobSupervisor`] trait, never on systemd specifics.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::warn;

use crate::domain::{truncate_output, STDERR_TRUNCATE, STDOUT_TRUNCATE};

/// Prefix of scope unit names and artifact files.
pub const UNIT_PREFIX: &str = "loanjobs-job";

/// Authoritative captured outcome of a supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalOutput {
    /// Exit code from the rc artifact; `-1` when it could not be read.
    pub exit_code: i32,
    /// Bounded stdout.
    pub stdout: String,
    /// Bounded stderr.
    pub stderr: String,
}

/// Liveness and artifact access for supervised pipeline runs.
pub trait JobSupervisor: Send + Sync {
    /// Supervision unit name for a job.
    fn unit_name(&self, job_id: &str) -> String;

    /// Whether the job's supervision unit is still active.
    fn is_alive(&self, job_id: &str) -> bool;

    /// Read the authoritative exit code and output artifacts.
    fn read_final_output(&self, job_id: &str) -> FinalOutput;

    /// Remove the job's artifacts.
    fn cleanup(&self, job_id: &str);
}

/// systemd-scope supervisor. Artifacts live under a temp directory as
/// `loanjobs-<job_id>.{stdout,stderr,rc}`.
#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    temp_dir: PathBuf,
}

impl SystemdSupervisor {
    /// Supervisor writing artifacts under `temp_dir`.
    #[must_use]
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    /// Stdout artifact path for a job.
    #[must_use]
    pub fn stdout_file(&self, job_id: &str) -> PathBuf {
        self.temp_dir.join(format!("loanjobs-{job_id}.stdout"))
    }

    /// Stderr artifact path for a job.
    #[must_use]
    pub fn stderr_file(&self, job_id: &str) -> PathBuf {
        self.temp_dir.join(format!("loanjobs-{job_id}.stderr"))
    }

    /// Exit-code artifact path for a job.
    #[must_use]
    pub fn rc_file(&self, job_id: &str) -> PathBuf {
        self.temp_dir.join(format!("loanjobs-{job_id}.rc"))
    }
}

impl JobSupervisor for SystemdSupervisor {
    fn unit_name(&self, job_id: &str) -> String {
        format!("{UNIT_PREFIX}-{job_id}")
    }

    fn is_alive(&self, job_id: &str) -> bool {
        let unit = format!("{}.scope", self.unit_name(job_id));
        Command::new("systemctl")
            .args(["is-active", "--quiet", &unit])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn read_final_output(&self, job_id: &str) -> FinalOutput {
        let stdout = std::fs::read_to_string(self.stdout_file(job_id)).unwrap_or_default();
        let stderr = std::fs::read_to_string(self.stderr_file(job_id)).unwrap_or_default();
        // The rc file carries the pipeline's own exit code; systemd-run's
        // status is not reliable when the orchestrator died mid-run.
        let exit_code = std::fs::read_to_string(self.rc_file(job_id))
            .ok()
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .unwrap_or(-1);
        FinalOutput {
            exit_code,
            stdout: truncate_output(&stdout, STDOUT_TRUNCATE),
            stderr: truncate_output(&stderr, STDERR_TRUNCATE),
        }
    }

    fn cleanup(&self, job_id: &str) {
        for path in [
            self.stdout_file(job_id),
            self.stderr_file(job_id),
            self.rc_file(job_id),
        ] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "artifact cleanup failed");
                }
            }
        }
    }
}

/// Whether `systemd-run` is on PATH and executable.
#[must_use]
pub fn systemd_run_available() -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join("systemd-run")))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
