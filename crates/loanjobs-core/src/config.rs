//! Runtime configuration for the job subsystem.
//!
//! Defaults mirror the production deployment; a bounded set of environment
//! variables may override individual limits. Environment reads are
//! length-validated and fail closed on non-UTF-8 values.

use std::path::PathBuf;

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Default base path for the shared job tree when `NAS_ANALYZE` is unset.
pub const DEFAULT_BASE_PATH: &str = "/mnt/nas_apps/nas_analyze";

/// Default number of newest job records loaded at startup.
pub const DEFAULT_RELOAD_LIMIT: usize = 500;

/// Default retention window for job record files, in days.
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Age after which a claim on a still-PENDING job is considered abandoned.
pub const DEFAULT_CLAIM_STALE_SECS: u64 = 300;

/// Sleep between resource-lock acquisition attempts.
pub const DEFAULT_LOCK_RETRY_SECS: u64 = 2;

/// Default wall-clock budget for one pipeline invocation.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;

/// Worker poll cadence.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Heartbeat older than this means no worker appears to be alive.
pub const DEFAULT_HEARTBEAT_STALE_SECS: u64 = 300;

/// Liveness poll cadence for adopted (orphaned) supervised jobs.
pub const DEFAULT_ORPHAN_POLL_SECS: u64 = 5;

/// Maximum accepted length for an overriding environment value.
const MAX_ENV_VALUE_LENGTH: usize = 4096;

// ─────────────────────────────────────────────────────────────────────────────
// Error types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from configuration loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// An environment value exceeded the accepted length.
    #[error("env var {var} value too long: {actual} bytes exceeds {max}")]
    EnvValueTooLong {
        /// Variable name.
        var: &'static str,
        /// Observed length in bytes.
        actual: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// An environment value was not valid UTF-8.
    #[error("env var {var} value is not valid UTF-8")]
    EnvValueNotUtf8 {
        /// Variable name.
        var: &'static str,
    },

    /// An environment value failed numeric parsing.
    #[error("env var {var} value {value:?} is not a valid number")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// Rejected value.
        value: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for the store, lock, runner and worker loop.
#[derive(Debug, Clone, PartialEq)]
pub struct JobsConfig {
    /// Root of the shared per-tenant job tree.
    pub base_path: PathBuf,
    /// Newest-first cap on records loaded by a bulk reload.
    pub reload_limit: usize,
    /// Record files older than this many days are pruned on reload.
    pub retention_days: u64,
    /// Claims older than this on PENDING jobs are garbage collected.
    pub claim_stale_secs: u64,
    /// Sleep between lock acquisition retries.
    pub lock_retry_secs: u64,
    /// Default pipeline timeout when the request does not set one.
    pub job_timeout_secs: u64,
    /// Worker poll cadence.
    pub poll_interval_secs: u64,
    /// Heartbeat staleness threshold.
    pub heartbeat_stale_secs: u64,
    /// Liveness poll cadence for orphan watchers.
    pub orphan_poll_secs: u64,
    /// Pipeline program and leading arguments, e.g.
    /// `["python3", "scripts/run_loan_job.py"]`.
    pub pipeline_command: Vec<String>,
    /// Directory for supervised-run output artifacts.
    pub temp_dir: PathBuf,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(DEFAULT_BASE_PATH),
            reload_limit: DEFAULT_RELOAD_LIMIT,
            retention_days: DEFAULT_RETENTION_DAYS,
            claim_stale_secs: DEFAULT_CLAIM_STALE_SECS,
            lock_retry_secs: DEFAULT_LOCK_RETRY_SECS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            heartbeat_stale_secs: DEFAULT_HEARTBEAT_STALE_SECS,
            orphan_poll_secs: DEFAULT_ORPHAN_POLL_SECS,
            pipeline_command: vec![
                "python3".to_string(),
                "scripts/run_loan_job.py".to_string(),
            ],
            temp_dir: PathBuf::from("/tmp"),
        }
    }
}

impl JobsConfig {
    /// Build a configuration from defaults plus environment overrides
    /// (`NAS_ANALYZE`, `JOB_RELOAD_LIMIT`, `JOB_RETENTION_DAYS`).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when an override is over-long, non-UTF-8, or
    /// fails numeric parsing.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(base) = read_bounded_env("NAS_ANALYZE")? {
            cfg.base_path = PathBuf::from(base);
        }
        if let Some(limit) = read_bounded_env("JOB_RELOAD_LIMIT")? {
            cfg.reload_limit =
                limit
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidNumber {
                        var: "JOB_RELOAD_LIMIT",
                        value: limit,
                    })?;
        }
        if let Some(days) = read_bounded_env("JOB_RETENTION_DAYS")? {
            cfg.retention_days =
                days.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
                    var: "JOB_RETENTION_DAYS",
                    value: days,
                })?;
        }
        Ok(cfg)
    }

    /// Retention window in seconds.
    #[must_use]
    pub const fn retention_secs(&self) -> u64 {
        self.retention_days * 24 * 3600
    }
}

/// Read an environment variable with bounded-length validation.
///
/// Returns `Ok(None)` if the variable is not set or empty.
fn read_bounded_env(var: &'static str) -> Result<Option<String>, ConfigError> {
    match std::env::var(var) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => {
            if value.len() > MAX_ENV_VALUE_LENGTH {
                return Err(ConfigError::EnvValueTooLong {
                    var,
                    actual: value.len(),
                    max: MAX_ENV_VALUE_LENGTH,
                });
            }
            Ok(Some(value))
        },
        Err(std::env::VarError::NotPresent) => Ok(None),
        // Non-UTF-8 is rejected rather than silently ignored.
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::EnvValueNotUtf8 { var }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
