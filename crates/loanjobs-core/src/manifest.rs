//! Reading the pipeline's own completion manifest.
//!
//! The pipeline writes `job_manifest.json` into its run directory when it
//! finishes. This core consults that file, never writes it: it is the
//! authority on whether a run actually succeeded, over and above the
//! process exit code.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::JobResultSummary;
use crate::paths::StoreLayout;

static RUN_ID_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"run_id\s*=\s*(\S+)").expect("run_id regex is valid"));

/// Completion record the pipeline writes for itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Outcome the pipeline reports (`"SUCCESS"` / `"FAIL"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Content hash of the retrieval pack built by the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_pack_sha256: Option<String>,
    /// Everything else the pipeline recorded; not interpreted here.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunManifest {
    /// Whether the pipeline reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("SUCCESS")
    }
}

/// Load the manifest for a run if it exists and parses; `None` otherwise.
#[must_use]
pub fn load_manifest_if_present(
    layout: &StoreLayout,
    tenant_id: &str,
    loan_id: &str,
    run_id: &str,
) -> Option<RunManifest> {
    let path = layout.manifest_file(tenant_id, loan_id, run_id);
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Result summary for a run, whatever status its manifest reports.
///
/// Used after a pipeline invocation: partial evidence is preserved even when
/// the job is classified FAIL.
#[must_use]
pub fn summary_if_manifest_present(
    layout: &StoreLayout,
    tenant_id: &str,
    loan_id: &str,
    run_id: &str,
) -> Option<JobResultSummary> {
    let manifest = load_manifest_if_present(layout, tenant_id, loan_id, run_id)?;
    Some(summary_from(layout, tenant_id, loan_id, run_id, &manifest))
}

/// Result summary only when the manifest exists and reports success.
///
/// Used by the enqueue short-circuit and by crash recovery, where anything
/// less than a success manifest means the work is not done.
#[must_use]
pub fn result_from_manifest(
    layout: &StoreLayout,
    tenant_id: &str,
    loan_id: &str,
    run_id: &str,
) -> Option<JobResultSummary> {
    let manifest = load_manifest_if_present(layout, tenant_id, loan_id, run_id)?;
    if !manifest.is_success() {
        return None;
    }
    Some(summary_from(layout, tenant_id, loan_id, run_id, &manifest))
}

fn summary_from(
    layout: &StoreLayout,
    tenant_id: &str,
    loan_id: &str,
    run_id: &str,
    manifest: &RunManifest,
) -> JobResultSummary {
    let manifest_path = layout.manifest_file(tenant_id, loan_id, run_id);
    let outputs_base = manifest_path
        .parent()
        .map(|p| p.to_string_lossy().into_owned());
    JobResultSummary {
        manifest_path: Some(manifest_path.to_string_lossy().into_owned()),
        status: manifest.status.clone(),
        rp_sha256: manifest.retrieval_pack_sha256.clone(),
        outputs_base,
    }
}

/// Extract the run id the pipeline printed, e.g. `run_id = 2024-06-01T...`.
#[must_use]
pub fn parse_run_id_from_stdout(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if let Some(caps) = RUN_ID_LINE.captures(line) {
            if let Some(m) = caps.get(1) {
                return Some(m.as_str().trim().to_string());
            }
        }
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
