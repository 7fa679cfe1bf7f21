//! Per-(tenant, loan) mutual-exclusion lock.
//!
//! The pipeline mutates shared per-loan state on disk and must never run
//! twice concurrently against the same loan. A single marker file created
//! with exclusive-create semantics is sufficient: only this subsystem
//! touches it, and existence alone is the signal. The file's content
//! (holder job id, timestamp) is advisory, for operators.
//!
//! # Invariants
//!
//! - `acquire` only returns once this caller created the marker; contention
//!   is waited out with a fixed sleep, any other I/O failure surfaces
//!   immediately.
//! - `release` and `clear_if_stale` are idempotent.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::domain::utc_now;
use crate::paths::StoreLayout;

/// Errors from lock operations.
///
/// Normal contention is not an error: `acquire` retries it internally.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// Unexpected I/O failure while creating or writing the marker.
    #[error("could not acquire loan lock: {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

impl LockError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// File-based per-loan lock.
#[derive(Debug, Clone)]
pub struct ResourceLock {
    layout: StoreLayout,
    retry: Duration,
}

impl ResourceLock {
    /// Lock rooted at `layout`, sleeping `retry_secs` between attempts.
    #[must_use]
    pub fn new(layout: StoreLayout, retry_secs: u64) -> Self {
        Self {
            layout,
            retry: Duration::from_secs(retry_secs),
        }
    }

    /// Block until the lock for (tenant, loan) is held by `job_id`.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Io` on any filesystem failure other than the
    /// marker already existing.
    pub async fn acquire(
        &self,
        tenant_id: &str,
        loan_id: &str,
        job_id: &str,
    ) -> Result<(), LockError> {
        let path = self.layout.lock_file(tenant_id, loan_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LockError::io(format!("creating lock dir {}", parent.display()), e))?;
        }
        let payload = json!({
            "job_id": job_id,
            "created_at_utc": utc_now(),
        })
        .to_string();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(payload.as_bytes()).map_err(|e| {
                        LockError::io(format!("writing lock file {}", path.display()), e)
                    })?;
                    file.sync_all().map_err(|e| {
                        LockError::io(format!("syncing lock file {}", path.display()), e)
                    })?;
                    return Ok(());
                },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(self.retry).await;
                },
                Err(e) => {
                    return Err(LockError::io(
                        format!("creating lock file {}", path.display()),
                        e,
                    ));
                },
            }
        }
    }

    /// Delete the marker if present; absence is not an error.
    pub fn release(&self, tenant_id: &str, loan_id: &str) {
        let path = self.layout.lock_file(tenant_id, loan_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "lock release failed");
            }
        }
    }

    /// Unconditional delete, used only during crash recovery when the prior
    /// holder is confirmed dead.
    pub fn clear_if_stale(&self, tenant_id: &str, loan_id: &str) {
        self.release(tenant_id, loan_id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_in(tmp: &TempDir) -> ResourceLock {
        ResourceLock::new(StoreLayout::new(tmp.path()), 0)
    }

    #[tokio::test]
    async fn acquire_creates_marker_with_holder() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp);
        lock.acquire("t1", "L1", "j1").await.unwrap();
        let path = StoreLayout::new(tmp.path()).lock_file("t1", "L1");
        let body: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(body["job_id"], "j1");
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let tmp = TempDir::new().unwrap();
        // Non-zero retry so the contender actually parks between attempts.
        let lock = ResourceLock::new(StoreLayout::new(tmp.path()), 1);
        lock.acquire("t1", "L1", "j1").await.unwrap();

        let contender = lock.clone();
        let handle =
            tokio::spawn(async move { contender.acquire("t1", "L1", "j2").await });
        // Give the contender a chance to hit the existing marker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "second acquire must block while held");

        lock.release("t1", "L1");
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp);
        lock.release("t1", "L1");
        lock.acquire("t1", "L1", "j1").await.unwrap();
        lock.release("t1", "L1");
        lock.release("t1", "L1");
        // Lock is free again.
        lock.acquire("t1", "L1", "j2").await.unwrap();
    }

    #[tokio::test]
    async fn clear_if_stale_removes_marker() {
        let tmp = TempDir::new().unwrap();
        let lock = lock_in(&tmp);
        lock.acquire("t1", "L1", "j1").await.unwrap();
        lock.clear_if_stale("t1", "L1");
        assert!(!StoreLayout::new(tmp.path()).lock_file("t1", "L1").exists());
    }
}
