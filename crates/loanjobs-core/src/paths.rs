//! Path layout of the on-disk job tree.
//!
//! Everything the subsystem persists lives under one base directory:
//!
//! ```text
//! <base>/tenants/<tenant>/loans/<loan>/_meta/jobs/<job_id>.json    job record
//! <base>/tenants/<tenant>/loans/<loan>/_meta/jobs/<job_id>.claim   claim marker
//! <base>/tenants/<tenant>/loans/<loan>/_meta/locks/loan.lock       resource lock
//! <base>/tenants/<tenant>/loans/<loan>/<run_id>/job_manifest.json  pipeline manifest
//! <base>/_meta/job_index/<job_id>.json                             job-id index
//! <base>/_meta/worker_heartbeat.json                               worker heartbeat
//! ```

use std::path::{Path, PathBuf};

/// Manifest file name written by the pipeline at the end of a run.
pub const MANIFEST_FILE_NAME: &str = "job_manifest.json";

/// Resolver for every path the job subsystem reads or writes.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    base: PathBuf,
}

impl StoreLayout {
    /// Create a layout rooted at `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Base directory of the whole tree.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `<base>/tenants`.
    #[must_use]
    pub fn tenants_dir(&self) -> PathBuf {
        self.base.join("tenants")
    }

    /// `<base>/tenants/<tenant>/loans`.
    #[must_use]
    pub fn loans_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenants_dir().join(tenant_id).join("loans")
    }

    /// Directory holding the loan's job records and claims.
    #[must_use]
    pub fn jobs_dir(&self, tenant_id: &str, loan_id: &str) -> PathBuf {
        self.loans_dir(tenant_id).join(loan_id).join("_meta").join("jobs")
    }

    /// Job record file.
    #[must_use]
    pub fn job_file(&self, tenant_id: &str, loan_id: &str, job_id: &str) -> PathBuf {
        self.jobs_dir(tenant_id, loan_id).join(format!("{job_id}.json"))
    }

    /// Claim marker file.
    #[must_use]
    pub fn claim_file(&self, tenant_id: &str, loan_id: &str, job_id: &str) -> PathBuf {
        self.jobs_dir(tenant_id, loan_id).join(format!("{job_id}.claim"))
    }

    /// Per-loan mutual-exclusion lock file.
    #[must_use]
    pub fn lock_file(&self, tenant_id: &str, loan_id: &str) -> PathBuf {
        self.loans_dir(tenant_id)
            .join(loan_id)
            .join("_meta")
            .join("locks")
            .join("loan.lock")
    }

    /// Output directory of one pipeline run.
    #[must_use]
    pub fn run_dir(&self, tenant_id: &str, loan_id: &str, run_id: &str) -> PathBuf {
        self.loans_dir(tenant_id).join(loan_id).join(run_id)
    }

    /// Manifest the pipeline writes on completion.
    #[must_use]
    pub fn manifest_file(&self, tenant_id: &str, loan_id: &str, run_id: &str) -> PathBuf {
        self.run_dir(tenant_id, loan_id, run_id).join(MANIFEST_FILE_NAME)
    }

    /// `<base>/_meta`.
    #[must_use]
    pub fn meta_dir(&self) -> PathBuf {
        self.base.join("_meta")
    }

    /// Directory of the job-id → (tenant, loan) index.
    #[must_use]
    pub fn job_index_dir(&self) -> PathBuf {
        self.meta_dir().join("job_index")
    }

    /// Index entry for one job id.
    #[must_use]
    pub fn job_index_file(&self, job_id: &str) -> PathBuf {
        self.job_index_dir().join(format!("{job_id}.json"))
    }

    /// Worker heartbeat file.
    #[must_use]
    pub fn heartbeat_file(&self) -> PathBuf {
        self.meta_dir().join("worker_heartbeat.json")
    }
}
