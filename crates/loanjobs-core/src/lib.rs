//! Durable, filesystem-only background job orchestration for loan document
//! pipelines.
//!
//! There is no database and no message broker: the filesystem is the sole
//! source of truth. Job records are individual JSON files written atomically,
//! claims and per-loan locks are exclusive-create marker files, and every
//! worker (thread or process) coordinates exclusively through those files.
//! The design survives process death at arbitrary points: startup reload
//! reconciles `RUNNING` records left behind by a crash, and jobs that keep
//! running under OS-level supervision after an orchestrator restart are
//! adopted by watcher tasks instead of being failed.
//!
//! # Invariants
//!
//! - Job record writes are atomic (temp file + rename); readers never observe
//!   a partially written record.
//! - At most one worker holds the claim for a given job, and at most one job
//!   holds the resource lock for a given (tenant, loan).
//! - Status transitions are forward-only: `PENDING → RUNNING → {SUCCESS,
//!   FAIL}`.
//! - Captured output and error strings are bounded by hard caps with a
//!   truncation sentinel.

pub mod config;
pub mod domain;
pub mod keyindex;
pub mod lock;
pub mod manifest;
pub mod paths;
pub mod reconcile;
pub mod runner;
pub mod service;
pub mod store;
pub mod supervise;
pub mod worker;

pub use config::JobsConfig;
pub use domain::{JobRecord, JobRequest, JobResultSummary, JobStatus};
pub use service::{EnqueueReceipt, JobService};
pub use store::DiskJobStore;
