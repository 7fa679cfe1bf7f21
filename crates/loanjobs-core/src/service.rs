//! Job orchestration: enqueue, execute, read projections.
//!
//! The filesystem stays authoritative throughout. The service keeps an
//! in-memory map of records, but it is a rebuildable read-through cache:
//! every mutation is persisted through the store before callers can
//! observe it, and a restart reconstructs the cache (and the key index)
//! with `load_all_from_disk`.
//!
//! All execution failures terminate at the job boundary: they become
//! `status=FAIL` plus a bounded error on the record, never an error to the
//! caller. Only malformed submissions fail `enqueue` itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::domain::{
    truncate_output, utc_now, JobRecord, JobRequest, JobStatus, ERROR_TRUNCATE, STDOUT_TRUNCATE,
};
use crate::keyindex::{compute_job_key, JobKeyIndex};
use crate::lock::ResourceLock;
use crate::manifest::{parse_run_id_from_stdout, result_from_manifest, summary_if_manifest_present};
use crate::runner::{job_env, PipelineRunner, RunnerError};
use crate::store::DiskJobStore;

// ─────────────────────────────────────────────────────────────────────────────
// Error types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors surfaced to `enqueue` callers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnqueueError {
    /// The submission is malformed; no job was created.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Receipts
// ─────────────────────────────────────────────────────────────────────────────

/// What a submitter gets back from `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    /// Identifier to poll.
    pub job_id: String,
    /// Status at submission time (`SUCCESS` when short-circuited).
    pub status: JobStatus,
    /// Poll URL for the job.
    pub status_url: String,
}

impl EnqueueReceipt {
    fn for_job(job_id: &str, status: JobStatus) -> Self {
        Self {
            job_id: job_id.to_string(),
            status,
            status_url: format!("/jobs/{job_id}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

struct ServiceState {
    jobs: HashMap<String, JobRecord>,
    key_index: JobKeyIndex,
}

/// Orchestrator over store, lock, key index and runner.
pub struct JobService {
    cfg: JobsConfig,
    store: DiskJobStore,
    lock: ResourceLock,
    runner: Arc<dyn PipelineRunner>,
    state: Mutex<ServiceState>,
}

impl JobService {
    /// Service over `cfg` using `runner` for pipeline invocations.
    #[must_use]
    pub fn new(cfg: JobsConfig, runner: Arc<dyn PipelineRunner>) -> Self {
        let store = DiskJobStore::new(&cfg);
        let lock = ResourceLock::new(store.layout().clone(), cfg.lock_retry_secs);
        Self {
            cfg,
            store,
            lock,
            runner,
            state: Mutex::new(ServiceState {
                jobs: HashMap::new(),
                key_index: JobKeyIndex::new(),
            }),
        }
    }

    /// The store this service persists through.
    #[must_use]
    pub fn store(&self) -> &DiskJobStore {
        &self.store
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &JobsConfig {
        &self.cfg
    }

    /// Load persisted jobs (with restart recovery) and rebuild the key
    /// index. Called once at startup.
    pub fn load_all_from_disk(&self) {
        let loaded = self.store.load_all();
        let mut state = self.lock_state();
        state.jobs.extend(loaded);
        let jobs = std::mem::take(&mut state.jobs);
        state.key_index.rebuild(&jobs);
        state.jobs = jobs;
        info!(count = state.jobs.len(), "jobs loaded from disk");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Enqueue
    // ─────────────────────────────────────────────────────────────────────

    /// Submit a job. Duplicate submissions converge on the existing job
    /// unless it already failed; an explicit run id whose success manifest
    /// already exists short-circuits to a terminal SUCCESS job.
    ///
    /// # Errors
    ///
    /// Returns `EnqueueError::InvalidRequest` for malformed submissions;
    /// nothing is created in that case.
    pub fn enqueue(
        &self,
        tenant_id: &str,
        loan_id: &str,
        request: JobRequest,
    ) -> Result<EnqueueReceipt, EnqueueError> {
        if tenant_id.is_empty() || loan_id.is_empty() {
            return Err(EnqueueError::InvalidRequest(
                "tenant_id and loan_id are required".to_string(),
            ));
        }
        let job_key = compute_job_key(tenant_id, loan_id, &request)
            .map_err(|e| EnqueueError::InvalidRequest(format!("unhashable request: {e}")))?;

        // Idempotent resubmission: PENDING/RUNNING/SUCCESS dedupe to the
        // existing job; FAIL falls through and retries with a fresh id.
        {
            let state = self.lock_state();
            if let Some(existing_id) = state.key_index.get(&job_key) {
                if let Some(existing) = state.jobs.get(existing_id) {
                    if existing.status != JobStatus::Fail {
                        return Ok(EnqueueReceipt::for_job(existing_id, existing.status));
                    }
                }
            }
        }

        // Work already done out-of-band: synthesize a terminal job rather
        // than re-running the pipeline.
        if let Some(run_id) = request.run_id.clone() {
            if !request.extra.contains_key("question") {
                if let Some(summary) =
                    result_from_manifest(self.store.layout(), tenant_id, loan_id, &run_id)
                {
                    let now = utc_now();
                    let mut job = JobRecord::new_pending(
                        Uuid::new_v4().to_string(),
                        tenant_id.to_string(),
                        loan_id.to_string(),
                        request,
                        job_key.clone(),
                    );
                    job.status = JobStatus::Success;
                    job.started_at_utc = Some(now.clone());
                    job.finished_at_utc = Some(now.clone());
                    job.result = Some(summary);
                    job.stdout = Some(format!("PHASE:DONE {now}\n"));
                    self.commit(&job);
                    self.index(&job);
                    info!(job_id = %job.job_id, run_id, "enqueue short-circuited from manifest");
                    return Ok(EnqueueReceipt::for_job(&job.job_id, JobStatus::Success));
                }
            }
        }

        let job = JobRecord::new_pending(
            Uuid::new_v4().to_string(),
            tenant_id.to_string(),
            loan_id.to_string(),
            request,
            job_key,
        );
        self.commit(&job);
        self.index(&job);
        info!(job_id = %job.job_id, tenant_id, loan_id, "job enqueued");
        Ok(EnqueueReceipt::for_job(&job.job_id, JobStatus::Pending))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Execute
    // ─────────────────────────────────────────────────────────────────────

    /// Run one claimed job to a terminal state: lock, RUNNING, pipeline,
    /// classify, persist. Single attempt; no automatic retry.
    pub async fn execute(&self, mut job: JobRecord) -> JobRecord {
        let tenant_id = job.tenant_id.clone();
        let loan_id = job.loan_id.clone();

        if let Err(e) = self.lock.acquire(&tenant_id, &loan_id, &job.job_id).await {
            warn!(job_id = %job.job_id, error = %e, "lock acquisition failed");
            return self.fail(job, &e.to_string());
        }

        job.status = JobStatus::Running;
        job.started_at_utc = Some(utc_now());
        self.commit(&job);

        let timeout_secs = job.request.effective_timeout(self.cfg.job_timeout_secs);
        let env = job_env(&job.request);
        let outcome = self
            .runner
            .run(
                &job.request,
                &tenant_id,
                &loan_id,
                &env,
                timeout_secs,
                &job.job_id,
            )
            .await;
        self.lock.release(&tenant_id, &loan_id);

        match outcome {
            Ok(output) => self.finalize(job, output.exit_code, &output.stdout, &output.stderr),
            Err(e @ RunnerError::TimedOut { .. }) => {
                warn!(job_id = %job.job_id, timeout_secs, "pipeline timed out");
                self.fail(job, &e.to_string())
            },
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "pipeline invocation failed");
                self.fail(job, &e.to_string())
            },
        }
    }

    /// Classify a completed pipeline invocation and persist the terminal
    /// record. SUCCESS requires both a zero exit code and a manifest that
    /// reports success; a manifest found on failure is still recorded.
    ///
    /// Shared by `execute` and by orphan watchers finalizing adopted jobs.
    pub fn finalize(
        &self,
        mut job: JobRecord,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) -> JobRecord {
        let resolved_run_id = job
            .request
            .run_id
            .clone()
            .or_else(|| parse_run_id_from_stdout(stdout));
        let summary = resolved_run_id.as_deref().and_then(|rid| {
            summary_if_manifest_present(self.store.layout(), &job.tenant_id, &job.loan_id, rid)
        });

        job.finished_at_utc = Some(utc_now());
        job.stdout = Some(truncate_output(stdout, STDOUT_TRUNCATE));
        job.stderr = Some(truncate_output(stderr, crate::domain::STDERR_TRUNCATE));
        job.run_id = resolved_run_id;

        let manifest_success = summary.as_ref().is_some_and(crate::domain::JobResultSummary::is_success);
        if exit_code == 0 && manifest_success {
            job.status = JobStatus::Success;
            job.result = summary;
            job.error = None;
            info!(job_id = %job.job_id, "job succeeded");
        } else {
            job.status = JobStatus::Fail;
            let error = if !stderr.is_empty() {
                stderr.to_string()
            } else if !stdout.is_empty() {
                stdout.to_string()
            } else {
                format!("Exit code {exit_code}")
            };
            job.error = Some(truncate_output(&error, ERROR_TRUNCATE));
            // Partial evidence: keep the manifest summary even on failure.
            if summary.is_some() {
                job.result = summary;
            }
            info!(job_id = %job.job_id, exit_code, "job failed");
        }
        self.commit(&job);
        job
    }

    /// Put a crash-recovered job back to RUNNING because its supervised
    /// pipeline invocation is confirmed still alive. Used only by orphan
    /// reconciliation at startup.
    pub fn restore_running(&self, job_id: &str) -> Option<JobRecord> {
        let mut state = self.lock_state();
        let job = state.jobs.get_mut(job_id)?;
        job.status = JobStatus::Running;
        job.finished_at_utc = None;
        job.error = None;
        job.result = None;
        let job = job.clone();
        drop(state);
        self.store.save(&job);
        Some(job)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Projections
    // ─────────────────────────────────────────────────────────────────────

    /// External view of one job, or `None` when unknown. Falls back to the
    /// disk index when the cache misses.
    #[must_use]
    pub fn get(&self, job_id: &str) -> Option<Value> {
        if let Some(job) = self.lock_state().jobs.get(job_id) {
            return Some(job.projection());
        }
        let (tenant_id, loan_id) = self.store.load_index_entry(job_id)?;
        let job = self.store.load_job(&tenant_id, &loan_id, job_id)?;
        let projection = job.projection();
        self.lock_state().jobs.insert(job.job_id.clone(), job);
        Some(projection)
    }

    /// Newest-first list of jobs, optionally status-filtered.
    #[must_use]
    pub fn list(&self, limit: usize, status: Option<JobStatus>) -> Vec<Value> {
        let state = self.lock_state();
        let mut jobs: Vec<&JobRecord> = state
            .jobs
            .values()
            .filter(|job| status.map_or(true, |want| job.status == want))
            .collect();
        jobs.sort_by(|a, b| b.created_at_utc.cmp(&a.created_at_utc));
        jobs.into_iter().take(limit).map(JobRecord::projection).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    /// Terminal FAIL with a bounded error.
    fn fail(&self, mut job: JobRecord, error: &str) -> JobRecord {
        job.status = JobStatus::Fail;
        job.finished_at_utc = Some(utc_now());
        job.error = Some(truncate_output(error, ERROR_TRUNCATE));
        self.commit(&job);
        job
    }

    /// Persist a record and refresh the cache entry.
    fn commit(&self, job: &JobRecord) {
        self.store.save(job);
        self.lock_state().jobs.insert(job.job_id.clone(), job.clone());
    }

    /// Record both index entries for a newly created job.
    fn index(&self, job: &JobRecord) {
        self.store
            .save_index_entry(&job.job_id, &job.tenant_id, &job.loan_id);
        self.lock_state()
            .key_index
            .set(job.job_key.clone(), job.job_id.clone());
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            // A poisoned cache is still just a cache; disk state is intact.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Test double returning a fixed outcome and counting invocations.
    struct FakeRunner {
        exit_code: i32,
        stdout: String,
        stderr: String,
        calls: AtomicUsize,
    }

    impl FakeRunner {
        fn new(exit_code: i32, stdout: &str, stderr: &str) -> Self {
            Self {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PipelineRunner for FakeRunner {
        async fn run(
            &self,
            _request: &JobRequest,
            _tenant_id: &str,
            _loan_id: &str,
            _env: &[(String, String)],
            _timeout_secs: u64,
            _job_id: &str,
        ) -> Result<RunOutput, RunnerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutput {
                exit_code: self.exit_code,
                stdout: self.stdout.clone(),
                stderr: self.stderr.clone(),
            })
        }
    }

    fn service_in(tmp: &TempDir, runner: Arc<dyn PipelineRunner>) -> JobService {
        let cfg = JobsConfig {
            base_path: tmp.path().to_path_buf(),
            lock_retry_secs: 0,
            ..JobsConfig::default()
        };
        JobService::new(cfg, runner)
    }

    fn write_manifest(service: &JobService, tenant: &str, loan: &str, run: &str, body: &str) {
        let path = service.store().layout().manifest_file(tenant, loan, run);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn request_with_run(run_id: &str) -> JobRequest {
        JobRequest {
            run_id: Some(run_id.into()),
            ..JobRequest::default()
        }
    }

    #[test]
    fn enqueue_rejects_empty_scope() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(&tmp, Arc::new(FakeRunner::new(0, "", "")));
        let err = service.enqueue("", "L1", JobRequest::default()).unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidRequest(_)));
    }

    #[test]
    fn enqueue_is_idempotent_while_not_failed() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(&tmp, Arc::new(FakeRunner::new(0, "", "")));
        let first = service.enqueue("t1", "L1", JobRequest::default()).unwrap();
        let second = service.enqueue("t1", "L1", JobRequest::default()).unwrap();
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.status, JobStatus::Pending);
        assert_eq!(second.status_url, format!("/jobs/{}", first.job_id));
    }

    #[tokio::test]
    async fn enqueue_after_fail_creates_new_job() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(&tmp, Arc::new(FakeRunner::new(1, "", "boom")));
        let first = service.enqueue("t1", "L1", JobRequest::default()).unwrap();
        let job = service
            .store()
            .load_job("t1", "L1", &first.job_id)
            .unwrap();
        let done = service.execute(job).await;
        assert_eq!(done.status, JobStatus::Fail);

        let second = service.enqueue("t1", "L1", JobRequest::default()).unwrap();
        assert_ne!(first.job_id, second.job_id, "failures are retryable");
    }

    #[test]
    fn enqueue_short_circuits_on_success_manifest() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(0, "", ""));
        let service = service_in(&tmp, runner.clone());
        write_manifest(
            &service,
            "t1",
            "L1",
            "R1",
            r#"{"status":"SUCCESS","retrieval_pack_sha256":"abc"}"#,
        );
        let receipt = service.enqueue("t1", "L1", request_with_run("R1")).unwrap();
        assert_eq!(receipt.status, JobStatus::Success);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0, "pipeline must not run");
        let projection = service.get(&receipt.job_id).unwrap();
        assert_eq!(projection["status"], "SUCCESS");
        assert_eq!(projection["result"]["rp_sha256"], "abc");
        assert!(projection["stdout"].as_str().unwrap().starts_with("PHASE:DONE"));
    }

    #[tokio::test]
    async fn execute_classifies_success_from_exit_code_and_manifest() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new(0, "starting\nrun_id = R9\n", ""));
        let service = service_in(&tmp, runner.clone());
        write_manifest(
            &service,
            "t1",
            "L1",
            "R9",
            r#"{"status":"SUCCESS","retrieval_pack_sha256":"hash9"}"#,
        );
        let receipt = service.enqueue("t1", "L1", JobRequest::default()).unwrap();
        let job = service.store().load_job("t1", "L1", &receipt.job_id).unwrap();
        let done = service.execute(job).await;

        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.run_id.as_deref(), Some("R9"), "run id parsed from stdout");
        assert_eq!(done.result.unwrap().rp_sha256.as_deref(), Some("hash9"));
        assert!(done.started_at_utc.is_some());
        assert!(done.finished_at_utc.is_some());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        // Lock is free again.
        assert!(!service.store().layout().lock_file("t1", "L1").exists());
    }

    #[tokio::test]
    async fn execute_fails_on_zero_exit_without_manifest() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(&tmp, Arc::new(FakeRunner::new(0, "no run id here", "")));
        let receipt = service.enqueue("t1", "L1", JobRequest::default()).unwrap();
        let job = service.store().load_job("t1", "L1", &receipt.job_id).unwrap();
        let done = service.execute(job).await;
        assert_eq!(done.status, JobStatus::Fail);
        assert_eq!(done.error.as_deref(), Some("no run id here"));
    }

    #[tokio::test]
    async fn execute_keeps_manifest_evidence_on_failure() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(&tmp, Arc::new(FakeRunner::new(2, "run_id = R2\n", "crash")));
        write_manifest(&service, "t1", "L1", "R2", r#"{"status":"FAIL"}"#);
        let receipt = service.enqueue("t1", "L1", JobRequest::default()).unwrap();
        let job = service.store().load_job("t1", "L1", &receipt.job_id).unwrap();
        let done = service.execute(job).await;
        assert_eq!(done.status, JobStatus::Fail);
        assert_eq!(done.error.as_deref(), Some("crash"));
        let result = done.result.unwrap();
        assert_eq!(result.status.as_deref(), Some("FAIL"));
    }

    #[tokio::test]
    async fn execute_reports_exit_code_when_output_is_empty() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(&tmp, Arc::new(FakeRunner::new(7, "", "")));
        let receipt = service.enqueue("t1", "L1", JobRequest::default()).unwrap();
        let job = service.store().load_job("t1", "L1", &receipt.job_id).unwrap();
        let done = service.execute(job).await;
        assert_eq!(done.error.as_deref(), Some("Exit code 7"));
    }

    #[test]
    fn get_falls_back_to_disk_index_on_cache_miss() {
        let tmp = TempDir::new().unwrap();
        let receipt = {
            let service = service_in(&tmp, Arc::new(FakeRunner::new(0, "", "")));
            service.enqueue("t1", "L1", JobRequest::default()).unwrap()
        };
        // A fresh service has an empty cache but the disk index survives.
        let fresh = service_in(&tmp, Arc::new(FakeRunner::new(0, "", "")));
        let projection = fresh.get(&receipt.job_id).unwrap();
        assert_eq!(projection["job_id"], receipt.job_id.as_str());
        assert!(fresh.get("unknown-id").is_none());
    }

    #[test]
    fn list_is_newest_first_and_filtered() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(&tmp, Arc::new(FakeRunner::new(0, "", "")));
        let mut first = JobRequest::default();
        first.extra.insert("n".into(), 1.into());
        let mut second = JobRequest::default();
        second.extra.insert("n".into(), 2.into());
        let a = service.enqueue("t1", "L1", first).unwrap();
        let b = service.enqueue("t1", "L2", second).unwrap();

        let all = service.list(10, None);
        assert_eq!(all.len(), 2);
        let pending = service.list(10, Some(JobStatus::Pending));
        assert_eq!(pending.len(), 2);
        assert!(service.list(10, Some(JobStatus::Success)).is_empty());
        assert_eq!(service.list(1, None).len(), 1);
        for entry in &all {
            let obj = entry.as_object().unwrap();
            assert!(!obj.contains_key("job_key"), "projection must strip job_key");
        }
        let ids: Vec<&str> = all.iter().map(|j| j["job_id"].as_str().unwrap()).collect();
        assert!(ids.contains(&a.job_id.as_str()) && ids.contains(&b.job_id.as_str()));
    }

    #[test]
    fn restore_running_reverses_recovery() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(&tmp, Arc::new(FakeRunner::new(0, "", "")));
        let receipt = service.enqueue("t1", "L1", JobRequest::default()).unwrap();
        // Simulate the crash-recovery FAIL the reconciler needs to undo.
        let mut job = service.store().load_job("t1", "L1", &receipt.job_id).unwrap();
        job.status = JobStatus::Fail;
        job.error = Some("Recovered after restart".into());
        service.commit(&job);

        let restored = service.restore_running(&receipt.job_id).unwrap();
        assert_eq!(restored.status, JobStatus::Running);
        assert!(restored.error.is_none());
        let on_disk = service.store().load_job("t1", "L1", &receipt.job_id).unwrap();
        assert_eq!(on_disk.status, JobStatus::Running);
    }
}
