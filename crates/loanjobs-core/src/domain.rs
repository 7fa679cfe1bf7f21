//! Job records, requests and the status state machine.
//!
//! A job record is one flat JSON document persisted as a single file. The
//! persisted form keeps `null` fields and the internal `job_key`; external
//! projections strip both.
//!
//! # Invariants
//!
//! - Status transitions are forward-only: `PENDING → RUNNING → {SUCCESS,
//!   FAIL}`.
//! - `stdout`/`stderr` never exceed [`STDOUT_TRUNCATE`]/[`STDERR_TRUNCATE`]
//!   and `error` never exceeds [`ERROR_TRUNCATE`]; oversized text ends with
//!   [`TRUNCATION_SENTINEL`].

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Cap on captured stdout stored in a job record.
pub const STDOUT_TRUNCATE: usize = 50_000;

/// Cap on captured stderr stored in a job record.
pub const STDERR_TRUNCATE: usize = 50_000;

/// Cap on the error string stored in a job record.
pub const ERROR_TRUNCATE: usize = 4_000;

/// Appended when captured text exceeds its cap.
pub const TRUNCATION_SENTINEL: &str = "\n... (truncated)";

// ─────────────────────────────────────────────────────────────────────────────
// Status state machine
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, waiting for a worker to claim it.
    Pending,
    /// Claimed and currently executing the pipeline.
    Running,
    /// Terminal: exit code zero and the manifest reported success.
    Success,
    /// Terminal: any other outcome.
    Fail,
}

impl JobStatus {
    /// Wire representation, identical to the persisted JSON value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
        }
    }

    /// Whether no further transitions occur from this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline parameters submitted with a job.
///
/// Known fields are typed; anything else passes through `extra` uninterpreted
/// and still participates in the idempotency fingerprint. Booleans stay real
/// booleans here; translation to the pipeline's `"1"/"0"` environment format
/// happens only at the runner boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Explicit external run identifier, if the submitter already knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Per-job timeout in seconds; the configured default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Skip the document intake phase.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_intake: bool,
    /// Skip the processing phase.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_process: bool,
    /// Override source directory for intake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    /// Verbose debug mode for smoke runs.
    #[serde(default, skip_serializing_if = "is_false")]
    pub smoke_debug: bool,
    /// Force LLM analysis on or off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_llm: Option<bool>,
    /// Upper bound on chunks the pipeline may drop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dropped_chunks: Option<u64>,
    /// Assert the retrieval-pack hash is unchanged across runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_rp_hash_stable: Option<bool>,
    /// Use offline embeddings.
    #[serde(default, skip_serializing_if = "is_false")]
    pub offline_embeddings: bool,
    /// Retrieval top-k override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    /// Retrieval per-file cap override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_file: Option<u64>,
    /// Pipeline-specific parameters the core does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRequest {
    /// Timeout for this job, falling back to `default_secs`.
    #[must_use]
    pub fn effective_timeout(&self, default_secs: u64) -> u64 {
        self.timeout.unwrap_or(default_secs)
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(v: &bool) -> bool {
    !*v
}

// ─────────────────────────────────────────────────────────────────────────────
// Result summary
// ─────────────────────────────────────────────────────────────────────────────

/// Structured outcome derived from the pipeline's own manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResultSummary {
    /// Path of the manifest file that was read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
    /// Status the manifest reported (`"SUCCESS"` / `"FAIL"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Retrieval-pack content hash from the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rp_sha256: Option<String>,
    /// Directory holding the run's outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_base: Option<String>,
}

impl JobResultSummary {
    /// Whether the manifest reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("SUCCESS")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job record
// ─────────────────────────────────────────────────────────────────────────────

/// The full persisted state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Globally unique identifier, immutable.
    pub job_id: String,
    /// Tenant scope, immutable.
    pub tenant_id: String,
    /// Loan scope, immutable.
    pub loan_id: String,
    /// Resolved external run identifier, if known.
    pub run_id: Option<String>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Creation time, RFC 3339 UTC. Empty only transiently: reload backfills
    /// a missing value from the record file's modification time.
    #[serde(default)]
    pub created_at_utc: String,
    /// Set when the job transitions to RUNNING.
    pub started_at_utc: Option<String>,
    /// Set when the job reaches a terminal state.
    pub finished_at_utc: Option<String>,
    /// Submitted pipeline parameters, immutable.
    pub request: JobRequest,
    /// Manifest-derived outcome, when a manifest was found.
    pub result: Option<JobResultSummary>,
    /// Bounded failure description, FAIL only.
    pub error: Option<String>,
    /// Bounded captured stdout.
    pub stdout: Option<String>,
    /// Bounded captured stderr.
    pub stderr: Option<String>,
    /// Idempotency fingerprint; never exposed in projections.
    pub job_key: String,
}

impl JobRecord {
    /// Create a fresh PENDING record.
    #[must_use]
    pub fn new_pending(
        job_id: String,
        tenant_id: String,
        loan_id: String,
        request: JobRequest,
        job_key: String,
    ) -> Self {
        Self {
            job_id,
            tenant_id,
            loan_id,
            run_id: request.run_id.clone(),
            status: JobStatus::Pending,
            created_at_utc: utc_now(),
            started_at_utc: None,
            finished_at_utc: None,
            request,
            result: None,
            error: None,
            stdout: None,
            stderr: None,
            job_key,
        }
    }

    /// External read-only view: `job_key` and null fields are stripped.
    ///
    /// The persisted form keeps nulls; only the projection is compacted.
    #[must_use]
    pub fn projection(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => {
                let compact: Map<String, Value> = map
                    .into_iter()
                    .filter(|(k, v)| k != "job_key" && !v.is_null())
                    .collect();
                Value::Object(compact)
            },
            // A record is always a JSON object; anything else is unreachable
            // in practice, but stay total.
            _ => Value::Null,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Current time as RFC 3339 UTC with a `Z` suffix.
#[must_use]
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Bound `s` to `max_len` bytes, appending the truncation sentinel when cut.
///
/// The cut lands on a UTF-8 boundary at or below `max_len`.
#[must_use]
pub fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATION_SENTINEL}", &s[..end])
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
