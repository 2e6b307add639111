//! Job queue and request storage.
//!
//! [`JobStore`] is the only point of mutual exclusion between workers: every
//! method is a single atomic step on the backend, so two workers can never
//! claim the same job and a result row never exists without its job being
//! marked done. Stores never retry; callers decide what a failure means.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::status::{QueueStatus, Severity};
use crate::types::{JobQueue, NewJob, PendingResult, RequestRef, ResultDetail};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {job_id} not found")]
    NotFound { job_id: i64 },

    /// A state transition the queue must never make, such as completing a
    /// job twice.
    #[error("queue invariant violated: {0}")]
    InvariantViolation(String),

    #[error("store backend error: {0}")]
    Backend(#[from] ::redis::RedisError),

    #[error("malformed record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `Pending`.
    async fn insert_job(&self, job: NewJob) -> StoreResult<JobQueue>;

    /// Atomically pick up to `limit` pending jobs, oldest first, and flip them
    /// to `Fetched`. The returned rows already carry the new status.
    async fn claim_pending(&self, limit: usize) -> StoreResult<Vec<JobQueue>>;

    async fn set_status(&self, job_id: i64, status: QueueStatus) -> StoreResult<()>;

    /// Move a job from `Fetched` to `Processing`. Returns `false` when the job
    /// is in any other status, which means another worker already owns it or
    /// it was reclaimed while waiting for a worker.
    async fn start_job(&self, job_id: i64) -> StoreResult<bool>;

    /// Insert the result row and mark the job `Done` in one step.
    /// Returns the new result id.
    async fn complete_with_result(&self, job_id: i64, result: ResultDetail) -> StoreResult<i64>;

    /// Move every job that has sat in `from` for longer than `stale_after`
    /// to `to`. Returns the moved jobs with their new status.
    async fn reclaim_stale(
        &self,
        from: QueueStatus,
        to: QueueStatus,
        stale_after: Duration,
    ) -> StoreResult<Vec<JobQueue>>;

    async fn delete_job(&self, job_id: i64) -> StoreResult<()>;

    async fn delete_result(&self, result_id: i64) -> StoreResult<()>;

    async fn get_job(&self, job_id: i64) -> StoreResult<Option<JobQueue>>;

    /// Jobs currently in `status`, least recently updated first.
    async fn fetch_by_status(&self, status: QueueStatus, limit: usize) -> StoreResult<Vec<JobQueue>>;

    /// Oldest results first, each with its job if the job row still exists.
    async fn fetch_results(&self, limit: usize) -> StoreResult<Vec<PendingResult>>;

    async fn count_by_status(&self) -> StoreResult<Vec<(QueueStatus, u64)>>;
}

/// Write side of the request tables the web layer reads.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn set_request_status(&self, request: RequestRef, status: Severity) -> StoreResult<()>;

    /// Show the request as `Judging` unless a final result is already
    /// attached. Returns whether the status was written.
    async fn mark_judging(&self, request: RequestRef) -> StoreResult<bool>;

    /// Overwrite the request's verdict and log with a finished result.
    async fn apply_result(&self, request: RequestRef, result: &ResultDetail) -> StoreResult<()>;
}

pub(crate) fn chrono_duration(stale_after: Duration) -> StoreResult<chrono::Duration> {
    chrono::Duration::from_std(stale_after)
        .map_err(|_| StoreError::InvariantViolation(format!("stale threshold out of range: {:?}", stale_after)))
}
