//! Polling worker: claims PENDING jobs and drives them to a terminal state.
//!
//! Any number of workers may run concurrently against the same tree; the
//! claim file decides who executes a job, and the re-check after claiming
//! defends against a racer that already advanced the record before this
//! worker observed its claim succeed.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::paths::StoreLayout;
use crate::service::JobService;
use crate::domain::{utc_now, JobStatus};

/// Process at most one PENDING job; returns whether one was processed.
///
/// Cycle: clear stale claims, list PENDING (optionally scoped), claim,
/// re-load and re-check, execute, release claim.
pub async fn run_one_cycle(
    service: &JobService,
    tenant_id: Option<&str>,
    loan_id: Option<&str>,
) -> bool {
    let store = service.store();
    store.clear_stale_claims(Duration::from_secs(service.config().claim_stale_secs));
    for (tid, lid, job_id) in store.list_pending(tenant_id, loan_id) {
        if !store.try_claim(&tid, &lid, &job_id) {
            continue;
        }
        // Another claimant may have advanced the job before our claim
        // landed; only a still-PENDING record is ours to run.
        let job = match store.load_job(&tid, &lid, &job_id) {
            Some(job) if job.status == JobStatus::Pending => job,
            _ => {
                store.release_claim(&tid, &lid, &job_id);
                continue;
            },
        };
        info!(job_id = %job_id, tenant_id = %tid, loan_id = %lid, "claimed job");
        let done = service.execute(job).await;
        store.release_claim(&tid, &lid, &job_id);
        debug!(job_id = %job_id, status = %done.status, "job finished");
        return true;
    }
    false
}

/// Write the worker heartbeat; advisory, failures only logged.
pub fn write_heartbeat(layout: &StoreLayout) {
    let path = layout.heartbeat_file();
    let body = json!({ "heartbeat_utc": utc_now() }).to_string();
    let result = (|| -> std::io::Result<()> {
        std::fs::create_dir_all(layout.meta_dir())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body.as_bytes())?;
        std::fs::rename(&tmp, &path)
    })();
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "heartbeat write failed");
    }
}

/// Log a warning when no worker has heartbeated within `max_age`.
/// Returns whether the heartbeat is missing or stale.
pub fn warn_if_no_recent_heartbeat(layout: &StoreLayout, max_age: Duration) -> bool {
    let path = layout.heartbeat_file();
    let stale = std::fs::metadata(&path)
        .and_then(|meta| meta.modified())
        .map(|mtime| {
            SystemTime::now()
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO)
                > max_age
        })
        .unwrap_or(true);
    if stale {
        warn!(
            path = %path.display(),
            "no recent worker heartbeat; background jobs will not progress"
        );
    }
    stale
}

/// Continuous poller over one service.
pub struct WorkerLoop {
    service: Arc<JobService>,
    poll_interval: Duration,
    tenant_id: Option<String>,
    loan_id: Option<String>,
}

impl WorkerLoop {
    /// Poller over `service`, optionally scoped to one tenant or loan.
    #[must_use]
    pub fn new(
        service: Arc<JobService>,
        poll_interval: Duration,
        tenant_id: Option<String>,
        loan_id: Option<String>,
    ) -> Self {
        Self {
            service,
            poll_interval,
            tenant_id,
            loan_id,
        }
    }

    /// One heartbeat-and-poll cycle; returns whether a job was processed.
    pub async fn run_once(&self) -> bool {
        write_heartbeat(self.service.store().layout());
        run_one_cycle(
            &self.service,
            self.tenant_id.as_deref(),
            self.loan_id.as_deref(),
        )
        .await
    }

    /// Poll until the future is dropped (e.g. by shutdown select).
    pub async fn run(&self) {
        loop {
            let _ = self.run_once().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
