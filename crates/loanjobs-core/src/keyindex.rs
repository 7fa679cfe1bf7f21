//! Idempotency fingerprint and the in-memory job-key index.
//!
//! The fingerprint is a SHA-256 over the canonical JSON form of
//! `{loan_id, request, tenant_id}`. Canonical means object keys sorted and
//! compact separators, so semantically identical requests hash identically
//! regardless of field order. `serde_json` provides this for free: its
//! default map is `BTreeMap`-backed (keys sorted) and `to_string` emits
//! compact output. The `preserve_order` feature must stay disabled.
//!
//! The index itself is derived state: it is never persisted and is rebuilt
//! from the loaded job set at startup.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::domain::{JobRecord, JobRequest};

/// Compute the idempotency fingerprint for a submission.
///
/// # Errors
///
/// Returns a serialization error only if the request contains values
/// `serde_json` cannot emit (e.g. a non-finite float smuggled through the
/// passthrough map).
pub fn compute_job_key(
    tenant_id: &str,
    loan_id: &str,
    request: &JobRequest,
) -> Result<String, serde_json::Error> {
    let payload = json!({
        "loan_id": loan_id,
        "request": request,
        "tenant_id": tenant_id,
    });
    let raw = serde_json::to_string(&payload)?;
    let digest = Sha256::digest(raw.as_bytes());
    let mut hex = String::with_capacity(64);
    for b in digest {
        let _ = write!(hex, "{b:02x}");
    }
    Ok(hex)
}

/// In-memory `job_key → job_id` map backing idempotent submission.
#[derive(Debug, Default)]
pub struct JobKeyIndex {
    index: HashMap<String, String>,
}

impl JobKeyIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the job id recorded for a fingerprint.
    #[must_use]
    pub fn get(&self, job_key: &str) -> Option<&str> {
        self.index.get(job_key).map(String::as_str)
    }

    /// Record (or overwrite) the job id for a fingerprint.
    pub fn set(&mut self, job_key: impl Into<String>, job_id: impl Into<String>) {
        self.index.insert(job_key.into(), job_id.into());
    }

    /// Reconstruct the index from a freshly loaded job set.
    pub fn rebuild(&mut self, jobs: &HashMap<String, JobRecord>) {
        self.index.clear();
        for job in jobs.values() {
            if !job.job_key.is_empty() {
                self.index.insert(job.job_key.clone(), job.job_id.clone());
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn job_key_is_order_insensitive() {
        let a: JobRequest =
            serde_json::from_str(r#"{"run_id":"R1","smoke_debug":true,"top_k":5}"#).unwrap();
        let b: JobRequest =
            serde_json::from_str(r#"{"top_k":5,"smoke_debug":true,"run_id":"R1"}"#).unwrap();
        let ka = compute_job_key("t1", "L1", &a).unwrap();
        let kb = compute_job_key("t1", "L1", &b).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka.len(), 64);
    }

    #[test]
    fn job_key_differs_across_scope_and_content() {
        let req = JobRequest::default();
        let base = compute_job_key("t1", "L1", &req).unwrap();
        assert_ne!(base, compute_job_key("t2", "L1", &req).unwrap());
        assert_ne!(base, compute_job_key("t1", "L2", &req).unwrap());
        let mut other = JobRequest::default();
        other.run_id = Some("R1".into());
        assert_ne!(base, compute_job_key("t1", "L1", &other).unwrap());
    }

    #[test]
    fn job_key_covers_passthrough_fields() {
        let mut a = JobRequest::default();
        a.extra.insert("question".into(), Value::String("q1".into()));
        let mut b = JobRequest::default();
        b.extra.insert("question".into(), Value::String("q2".into()));
        assert_ne!(
            compute_job_key("t1", "L1", &a).unwrap(),
            compute_job_key("t1", "L1", &b).unwrap()
        );
    }

    #[test]
    fn rebuild_replaces_prior_entries() {
        let mut index = JobKeyIndex::new();
        index.set("stale", "old-job");
        let mut jobs = HashMap::new();
        let rec = JobRecord::new_pending(
            "j1".into(),
            "t1".into(),
            "L1".into(),
            JobRequest::default(),
            "k1".into(),
        );
        jobs.insert(rec.job_id.clone(), rec);
        index.rebuild(&jobs);
        assert_eq!(index.get("stale"), None);
        assert_eq!(index.get("k1"), Some("j1"));
    }
}
