//! Disk-backed job store: durable, crash-safe persistence and discovery.
//!
//! Every mutation is either an atomic rename (record writes) or an
//! exclusive create (claims), so concurrent workers and crashed processes
//! never corrupt state. Read paths tolerate and log-skip malformed files
//! rather than failing a whole scan.
//!
//! # Invariants
//!
//! - A record file is never observed partially written (temp + rename).
//! - `try_claim` succeeds for exactly one of any number of racing callers.
//! - `save` never returns an error to its caller: a failed write is logged
//!   and effectively retried on the next state transition, so a transient
//!   disk error cannot strand a job without a terminal record.
//! - Bulk reload is bounded: only the newest `reload_limit` records load.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tracing::warn;

use crate::config::JobsConfig;
use crate::domain::{truncate_output, utc_now, JobRecord, JobStatus, ERROR_TRUNCATE};
use crate::lock::ResourceLock;
use crate::manifest::result_from_manifest;
use crate::paths::StoreLayout;

/// Error message recorded on RUNNING jobs failed by crash recovery.
pub const RECOVERY_ERROR: &str = "Recovered after restart: job was RUNNING but no active worker";

/// JSON-file-per-job store rooted at a shared base directory.
#[derive(Debug, Clone)]
pub struct DiskJobStore {
    layout: StoreLayout,
    reload_limit: usize,
    retention: Duration,
    lock_retry_secs: u64,
}

impl DiskJobStore {
    /// Store configured from `cfg`.
    #[must_use]
    pub fn new(cfg: &JobsConfig) -> Self {
        Self {
            layout: StoreLayout::new(cfg.base_path.clone()),
            reload_limit: cfg.reload_limit,
            retention: Duration::from_secs(cfg.retention_secs()),
            lock_retry_secs: cfg.lock_retry_secs,
        }
    }

    /// Path layout this store operates on.
    #[must_use]
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    // ─────────────────────────────────────────────────────────────────────
    // Record persistence
    // ─────────────────────────────────────────────────────────────────────

    /// Persist a record atomically. Failures are logged, never raised.
    pub fn save(&self, job: &JobRecord) {
        if job.tenant_id.is_empty() || job.loan_id.is_empty() || job.job_id.is_empty() {
            warn!(job_id = %job.job_id, "refusing to persist job with empty scope");
            return;
        }
        let path = self.layout.job_file(&job.tenant_id, &job.loan_id, &job.job_id);
        let body = match serde_json::to_vec(job) {
            Ok(body) => body,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "job serialization failed");
                return;
            },
        };
        if let Err(e) = write_atomic(&path, &body) {
            warn!(job_id = %job.job_id, path = %path.display(), error = %e, "job persist failed");
        }
    }

    /// Load a single record. `None` if missing, malformed, or the file's
    /// content does not match the requested job id.
    #[must_use]
    pub fn load_job(&self, tenant_id: &str, loan_id: &str, job_id: &str) -> Option<JobRecord> {
        let path = self.layout.job_file(tenant_id, loan_id, job_id);
        let raw = fs::read_to_string(path).ok()?;
        let job: JobRecord = serde_json::from_str(&raw).ok()?;
        if job.job_id != job_id {
            return None;
        }
        Some(job)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Discovery
    // ─────────────────────────────────────────────────────────────────────

    /// `(tenant, loan, job_id)` of every PENDING record, optionally scoped.
    #[must_use]
    pub fn list_pending(
        &self,
        tenant_id: Option<&str>,
        loan_id: Option<&str>,
    ) -> Vec<(String, String, String)> {
        let mut out = Vec::new();
        for (tid, lid, jobs_dir) in self.jobs_dirs(tenant_id, loan_id) {
            for path in record_files(&jobs_dir) {
                let Ok(raw) = fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(job) = serde_json::from_str::<JobRecord>(&raw) else {
                    continue;
                };
                if job.status == JobStatus::Pending && !job.job_id.is_empty() {
                    out.push((tid.clone(), lid.clone(), job.job_id));
                }
            }
        }
        out
    }

    /// Every record currently persisted as RUNNING, across all scopes.
    ///
    /// Used by orphan reconciliation, which must inventory survivors before
    /// the standard crash-recovery pass rewrites them.
    #[must_use]
    pub fn list_running(&self) -> Vec<JobRecord> {
        let mut out = Vec::new();
        for (_, _, jobs_dir) in self.jobs_dirs(None, None) {
            for path in record_files(&jobs_dir) {
                let Ok(raw) = fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(job) = serde_json::from_str::<JobRecord>(&raw) else {
                    continue;
                };
                if job.status == JobStatus::Running {
                    out.push(job);
                }
            }
        }
        out
    }

    // ─────────────────────────────────────────────────────────────────────
    // Claims
    // ─────────────────────────────────────────────────────────────────────

    /// Atomically claim a job via exclusive create. Exactly one of any
    /// number of racing callers succeeds.
    #[must_use]
    pub fn try_claim(&self, tenant_id: &str, loan_id: &str, job_id: &str) -> bool {
        let path = self.layout.claim_file(tenant_id, loan_id, job_id);
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "claim dir create failed");
                return false;
            }
        }
        let payload = json!({ "claimed_at_utc": utc_now() }).to_string();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(payload.as_bytes()).and_then(|()| file.sync_all()) {
                    warn!(path = %path.display(), error = %e, "claim write failed");
                }
                true
            },
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "claim create failed");
                false
            },
        }
    }

    /// Remove a claim marker; idempotent.
    pub fn release_claim(&self, tenant_id: &str, loan_id: &str, job_id: &str) {
        let path = self.layout.claim_file(tenant_id, loan_id, job_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "claim release failed");
            }
        }
    }

    /// Delete claim markers older than `max_age` whose job is still PENDING.
    ///
    /// Recovers jobs abandoned by a worker that died between claiming and
    /// transitioning the record to RUNNING.
    pub fn clear_stale_claims(&self, max_age: Duration) {
        let now = SystemTime::now();
        for (_, _, jobs_dir) in self.jobs_dirs(None, None) {
            let Ok(entries) = fs::read_dir(&jobs_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("claim") {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let Ok(mtime) = meta.modified() else {
                    continue;
                };
                let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
                if age <= max_age {
                    continue;
                }
                let Some(job_id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let job_path = jobs_dir.join(format!("{job_id}.json"));
                let Ok(raw) = fs::read_to_string(&job_path) else {
                    continue;
                };
                let Ok(job) = serde_json::from_str::<JobRecord>(&raw) else {
                    continue;
                };
                if job.status == JobStatus::Pending {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "stale claim delete failed");
                    }
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bulk reload
    // ─────────────────────────────────────────────────────────────────────

    /// Load persisted jobs at startup: bounded newest-first reload, crash
    /// recovery for RUNNING records, retention pruning.
    #[must_use]
    pub fn load_all(&self) -> HashMap<String, JobRecord> {
        let mut collected: Vec<(PathBuf, SystemTime)> = Vec::new();
        for (_, _, jobs_dir) in self.jobs_dirs(None, None) {
            for path in record_files(&jobs_dir) {
                let Ok(meta) = fs::metadata(&path) else {
                    continue;
                };
                let Ok(mtime) = meta.modified() else {
                    continue;
                };
                collected.push((path, mtime));
            }
        }
        collected.sort_by(|a, b| b.1.cmp(&a.1));

        let mut jobs: HashMap<String, JobRecord> = HashMap::new();
        for (path, mtime) in collected.iter().take(self.reload_limit) {
            let raw = match fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "reload skip: unreadable");
                    continue;
                },
            };
            let mut job: JobRecord = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "reload skip: malformed record");
                    continue;
                },
            };
            if job.job_id.is_empty() {
                warn!(path = %path.display(), "reload skip: missing job_id");
                continue;
            }
            if jobs.contains_key(&job.job_id) {
                continue;
            }
            if job.created_at_utc.is_empty() {
                job.created_at_utc =
                    DateTime::<Utc>::from(*mtime).to_rfc3339_opts(SecondsFormat::Secs, true);
            }
            jobs.insert(job.job_id.clone(), job);
        }

        self.recover_running(&mut jobs);

        // Retention applies to every file on disk, loaded or not, and to
        // every status.
        let now = SystemTime::now();
        for (path, mtime) in &collected {
            let age = now.duration_since(*mtime).unwrap_or(Duration::ZERO);
            if age > self.retention {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "retention delete failed");
                }
            }
        }
        jobs
    }

    /// Resolve the true outcome of records left RUNNING by a dead process:
    /// SUCCESS when the run's manifest reports success, FAIL otherwise. The
    /// resource lock is cleared unconditionally since the holder is dead.
    fn recover_running(&self, jobs: &mut HashMap<String, JobRecord>) {
        let lock = ResourceLock::new(self.layout.clone(), self.lock_retry_secs);
        for job in jobs.values_mut() {
            if job.status != JobStatus::Running {
                continue;
            }
            if job.tenant_id.is_empty() || job.loan_id.is_empty() {
                continue;
            }
            let summary = job.run_id.as_deref().and_then(|rid| {
                result_from_manifest(&self.layout, &job.tenant_id, &job.loan_id, rid)
            });
            lock.clear_if_stale(&job.tenant_id, &job.loan_id);
            job.finished_at_utc = Some(utc_now());
            match summary {
                Some(summary) => {
                    job.status = JobStatus::Success;
                    job.result = Some(summary);
                    job.error = None;
                },
                None => {
                    job.status = JobStatus::Fail;
                    job.error = Some(truncate_output(RECOVERY_ERROR, ERROR_TRUNCATE));
                },
            }
            self.save(job);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Job-id index
    // ─────────────────────────────────────────────────────────────────────

    /// Atomically record where a job id lives, so lookups by id need no
    /// tree scan. Failures are logged, never raised.
    pub fn save_index_entry(&self, job_id: &str, tenant_id: &str, loan_id: &str) {
        let path = self.layout.job_index_file(job_id);
        let body = json!({ "tenant_id": tenant_id, "loan_id": loan_id }).to_string();
        if let Err(e) = write_atomic(&path, body.as_bytes()) {
            warn!(job_id, error = %e, "job index write failed");
        }
    }

    /// `(tenant_id, loan_id)` for a job id, or `None` when unindexed.
    #[must_use]
    pub fn load_index_entry(&self, job_id: &str) -> Option<(String, String)> {
        let raw = fs::read_to_string(self.layout.job_index_file(job_id)).ok()?;
        let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let tenant = value.get("tenant_id")?.as_str()?;
        let loan = value.get("loan_id")?.as_str()?;
        if tenant.is_empty() || loan.is_empty() {
            return None;
        }
        Some((tenant.to_string(), loan.to_string()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tree walking
    // ─────────────────────────────────────────────────────────────────────

    /// `(tenant, loan, jobs_dir)` for every loan, optionally scoped.
    /// I/O errors terminate the walk silently, matching read-path tolerance.
    fn jobs_dirs(
        &self,
        tenant_id: Option<&str>,
        loan_id: Option<&str>,
    ) -> Vec<(String, String, PathBuf)> {
        let mut out = Vec::new();
        let Ok(tenants) = fs::read_dir(self.layout.tenants_dir()) else {
            return out;
        };
        for tenant in tenants.flatten() {
            if !tenant.path().is_dir() {
                continue;
            }
            let tid = tenant.file_name().to_string_lossy().into_owned();
            if tenant_id.is_some_and(|want| want != tid) {
                continue;
            }
            let Ok(loans) = fs::read_dir(tenant.path().join("loans")) else {
                continue;
            };
            for loan in loans.flatten() {
                if !loan.path().is_dir() {
                    continue;
                }
                let lid = loan.file_name().to_string_lossy().into_owned();
                if loan_id.is_some_and(|want| want != lid) {
                    continue;
                }
                let jobs_dir = loan.path().join("_meta").join("jobs");
                if jobs_dir.is_dir() {
                    out.push((tid.clone(), lid, jobs_dir));
                }
            }
        }
        out
    }
}

/// Write `body` to a temp sibling and atomically rename over `path`.
fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    fs::create_dir_all(parent)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)
}

/// `.json` record files in one jobs directory.
fn record_files(jobs_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(jobs_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobRequest;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> DiskJobStore {
        let cfg = JobsConfig {
            base_path: tmp.path().to_path_buf(),
            ..JobsConfig::default()
        };
        DiskJobStore::new(&cfg)
    }

    fn pending_job(job_id: &str, tenant: &str, loan: &str) -> JobRecord {
        JobRecord::new_pending(
            job_id.into(),
            tenant.into(),
            loan.into(),
            JobRequest::default(),
            format!("key-{job_id}"),
        )
    }

    #[test]
    fn save_then_load_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let job = pending_job("j1", "t1", "L1");
        store.save(&job);
        let loaded = store.load_job("t1", "L1", "j1").unwrap();
        assert_eq!(loaded, job);
        // No temp file left behind.
        let dir = store.layout().jobs_dir("t1", "L1");
        let leftovers: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn load_job_rejects_id_mismatch() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let job = pending_job("j1", "t1", "L1");
        // Write j1's content under j2's filename.
        let path = store.layout().job_file("t1", "L1", "j2");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec(&job).unwrap()).unwrap();
        assert!(store.load_job("t1", "L1", "j2").is_none());
    }

    #[test]
    fn list_pending_filters_by_status_and_scope() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.save(&pending_job("j1", "t1", "L1"));
        store.save(&pending_job("j2", "t1", "L2"));
        let mut done = pending_job("j3", "t1", "L1");
        done.status = JobStatus::Success;
        store.save(&done);

        let all = store.list_pending(None, None);
        assert_eq!(all.len(), 2);
        let scoped = store.list_pending(Some("t1"), Some("L2"));
        assert_eq!(scoped, vec![("t1".into(), "L2".into(), "j2".into())]);
        assert!(store.list_pending(Some("t9"), None).is_empty());
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        assert!(store.try_claim("t1", "L1", "j1"));
        assert!(!store.try_claim("t1", "L1", "j1"), "second claim must lose");
        store.release_claim("t1", "L1", "j1");
        store.release_claim("t1", "L1", "j1");
        assert!(store.try_claim("t1", "L1", "j1"));
    }

    #[test]
    fn stale_claims_cleared_only_for_pending_jobs() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.save(&pending_job("j1", "t1", "L1"));
        let mut running = pending_job("j2", "t1", "L1");
        running.status = JobStatus::Running;
        store.save(&running);
        assert!(store.try_claim("t1", "L1", "j1"));
        assert!(store.try_claim("t1", "L1", "j2"));

        std::thread::sleep(Duration::from_millis(20));
        store.clear_stale_claims(Duration::from_millis(1));

        assert!(
            !store.layout().claim_file("t1", "L1", "j1").exists(),
            "stale claim on PENDING job must be cleared"
        );
        assert!(
            store.layout().claim_file("t1", "L1", "j2").exists(),
            "claim on RUNNING job must survive"
        );
    }

    #[test]
    fn fresh_claims_survive_gc() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        store.save(&pending_job("j1", "t1", "L1"));
        assert!(store.try_claim("t1", "L1", "j1"));
        store.clear_stale_claims(Duration::from_secs(300));
        assert!(store.layout().claim_file("t1", "L1", "j1").exists());
    }

    #[test]
    fn load_all_recovers_running_without_manifest_as_fail() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let mut job = pending_job("j1", "t1", "L1");
        job.status = JobStatus::Running;
        job.started_at_utc = Some(utc_now());
        store.save(&job);
        // Simulate the dead holder's lock.
        let lock_path = store.layout().lock_file("t1", "L1");
        std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        std::fs::write(&lock_path, "{}").unwrap();

        let jobs = store.load_all();
        let recovered = &jobs["j1"];
        assert_eq!(recovered.status, JobStatus::Fail);
        assert!(recovered.error.as_deref().unwrap().contains("Recovered after restart"));
        assert!(recovered.finished_at_utc.is_some());
        assert!(!lock_path.exists(), "dead holder's lock must be cleared");
        // Correction is persisted, not just in-memory.
        let on_disk = store.load_job("t1", "L1", "j1").unwrap();
        assert_eq!(on_disk.status, JobStatus::Fail);
    }

    #[test]
    fn load_all_recovers_running_with_success_manifest_as_success() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let mut job = pending_job("j1", "t1", "L1");
        job.status = JobStatus::Running;
        job.run_id = Some("R1".into());
        store.save(&job);
        let manifest = store.layout().manifest_file("t1", "L1", "R1");
        std::fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        std::fs::write(
            &manifest,
            r#"{"status":"SUCCESS","retrieval_pack_sha256":"abc"}"#,
        )
        .unwrap();

        let jobs = store.load_all();
        let recovered = &jobs["j1"];
        assert_eq!(recovered.status, JobStatus::Success);
        assert!(recovered.error.is_none());
        let result = recovered.result.as_ref().unwrap();
        assert_eq!(result.rp_sha256.as_deref(), Some("abc"));
    }

    #[test]
    fn load_all_is_bounded_newest_first() {
        let tmp = TempDir::new().unwrap();
        let cfg = JobsConfig {
            base_path: tmp.path().to_path_buf(),
            reload_limit: 1,
            ..JobsConfig::default()
        };
        let store = DiskJobStore::new(&cfg);
        store.save(&pending_job("older", "t1", "L1"));
        std::thread::sleep(Duration::from_millis(20));
        store.save(&pending_job("newer", "t1", "L1"));

        let jobs = store.load_all();
        assert_eq!(jobs.len(), 1);
        assert!(jobs.contains_key("newer"), "only the newest record loads");
    }

    #[test]
    fn load_all_skips_malformed_and_backfills_created_at() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let jobs_dir = store.layout().jobs_dir("t1", "L1");
        std::fs::create_dir_all(&jobs_dir).unwrap();
        std::fs::write(jobs_dir.join("bad.json"), "{not json").unwrap();
        std::fs::write(
            jobs_dir.join("j1.json"),
            r#"{"job_id":"j1","tenant_id":"t1","loan_id":"L1","run_id":null,"status":"SUCCESS","started_at_utc":null,"finished_at_utc":null,"request":{},"result":null,"error":null,"stdout":null,"stderr":null,"job_key":"k"}"#,
        )
        .unwrap();

        let jobs = store.load_all();
        assert_eq!(jobs.len(), 1);
        assert!(
            !jobs["j1"].created_at_utc.is_empty(),
            "created_at_utc must be backfilled from mtime"
        );
    }

    #[test]
    fn retention_prunes_old_records_regardless_of_status() {
        let tmp = TempDir::new().unwrap();
        let cfg = JobsConfig {
            base_path: tmp.path().to_path_buf(),
            retention_days: 0,
            ..JobsConfig::default()
        };
        let store = DiskJobStore::new(&cfg);
        let mut done = pending_job("j1", "t1", "L1");
        done.status = JobStatus::Success;
        store.save(&done);
        std::thread::sleep(Duration::from_millis(20));

        let _ = store.load_all();
        assert!(
            !store.layout().job_file("t1", "L1", "j1").exists(),
            "record past retention must be deleted"
        );
    }

    #[test]
    fn job_index_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        assert!(store.load_index_entry("j1").is_none());
        store.save_index_entry("j1", "t1", "L1");
        assert_eq!(
            store.load_index_entry("j1"),
            Some(("t1".to_string(), "L1".to_string()))
        );
    }
}
