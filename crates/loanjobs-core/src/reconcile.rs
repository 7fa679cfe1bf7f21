//! Startup reconciliation of supervised jobs that outlived the orchestrator.
//!
//! A supervised pipeline run keeps executing in its systemd scope when the
//! orchestrating process restarts. The standard crash-recovery pass in
//! `load_all` would misclassify such a job FAIL ("no active worker"), so
//! startup is ordered in three steps:
//!
//! 1. Inventory RUNNING records whose supervision unit is confirmed alive,
//!    before recovery rewrites them.
//! 2. Run the standard reload (which fails the genuinely dead ones).
//! 3. Restore the survivors to RUNNING and spawn one watcher per job that
//!    polls the unit until it exits, then finalizes from the supervisor's
//!    authoritative artifacts through the normal classification path.
//!
//! # Invariants
//!
//! - A watcher never re-runs the pipeline; it only observes and finalizes.
//! - Watchers are bounded by the job timeout; expiry finalizes FAIL.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::domain::JobRecord;
use crate::service::JobService;
use crate::supervise::JobSupervisor;

/// A RUNNING job whose supervision unit survived the restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedJob {
    /// Tenant scope.
    pub tenant_id: String,
    /// Loan scope.
    pub loan_id: String,
    /// Job identifier; also names the supervision unit.
    pub job_id: String,
}

impl OrphanedJob {
    fn from_record(job: &JobRecord) -> Self {
        Self {
            tenant_id: job.tenant_id.clone(),
            loan_id: job.loan_id.clone(),
            job_id: job.job_id.clone(),
        }
    }
}

/// RUNNING records on disk whose supervision unit is still active.
///
/// Must run before `load_all`, which rewrites RUNNING records.
#[must_use]
pub fn find_orphaned_running(
    service: &JobService,
    supervisor: &dyn JobSupervisor,
) -> Vec<OrphanedJob> {
    service
        .store()
        .list_running()
        .iter()
        .filter(|job| supervisor.is_alive(&job.job_id))
        .map(OrphanedJob::from_record)
        .collect()
}

/// Full startup sequence: orphan inventory, standard reload with crash
/// recovery, then adoption of the survivors by watcher tasks.
pub fn startup_with_orphans(
    service: &Arc<JobService>,
    supervisor: &Arc<dyn JobSupervisor>,
) {
    let orphans = find_orphaned_running(service, supervisor.as_ref());
    service.load_all_from_disk();
    for orphan in orphans {
        let Some(job) = service.restore_running(&orphan.job_id) else {
            // Not in the bounded reload window; leave the recovery verdict.
            warn!(job_id = %orphan.job_id, "orphan not in reload window, skipping adoption");
            continue;
        };
        info!(
            job_id = %job.job_id,
            unit = %supervisor.unit_name(&job.job_id),
            "adopting supervised job left running across restart"
        );
        let service = Arc::clone(service);
        let supervisor = Arc::clone(supervisor);
        tokio::spawn(async move {
            watch_orphaned_job(&service, supervisor.as_ref(), job).await;
        });
    }
}

/// Poll the supervision unit until it exits (or the job timeout passes),
/// then finalize the job from the supervisor's artifacts.
pub async fn watch_orphaned_job(
    service: &JobService,
    supervisor: &dyn JobSupervisor,
    job: JobRecord,
) {
    let poll = Duration::from_secs(service.config().orphan_poll_secs);
    let budget = Duration::from_secs(
        job.request
            .effective_timeout(service.config().job_timeout_secs),
    );
    let started = tokio::time::Instant::now();
    while supervisor.is_alive(&job.job_id) {
        if started.elapsed() >= budget {
            warn!(job_id = %job.job_id, "adopted job exceeded its timeout");
            break;
        }
        tokio::time::sleep(poll).await;
    }

    let output = supervisor.read_final_output(&job.job_id);
    let job_id = job.job_id.clone();
    let done = service.finalize(job, output.exit_code, &output.stdout, &output.stderr);
    supervisor.cleanup(&job_id);
    info!(job_id = %job_id, status = %done.status, "adopted job finalized");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
