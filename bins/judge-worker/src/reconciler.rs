//! Background reconciliation of the job queue.
//!
//! Two loops run next to the worker pool:
//! - the reclaim loop returns jobs stuck in `Processing` or `Fetched` to
//!   `Pending` once they are older than the stale threshold
//! - the drain loop hands finished work back to the request tables and
//!   deletes the job and result rows afterwards
//!
//! Both loops only talk to the stores and can run on every worker host at
//! once. Deletes are idempotent, and the `Judging` mark is conditional so a
//! stale snapshot of a running job never covers a result another host has
//! already handed back.

use anyhow::{Context, Result};
use judge_common::{JobStore, QueueStatus, RequestStore, Severity};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics;

const BUSY_SLEEP: Duration = Duration::from_millis(100);
const IDLE_SLEEP: Duration = Duration::from_secs(2);

/// Statuses the reclaim loop sweeps, in order.
const RECLAIMABLE: [QueueStatus; 2] = [QueueStatus::Processing, QueueStatus::Fetched];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub marked_judging: usize,
    pub failed: usize,
    pub applied: usize,
    pub orphaned: usize,
}

impl DrainReport {
    /// Whether the pass removed any rows. Marking running jobs does not count.
    pub fn is_busy(&self) -> bool {
        self.failed + self.applied + self.orphaned > 0
    }
}

pub struct Reconciler {
    jobs: Arc<dyn JobStore>,
    requests: Arc<dyn RequestStore>,
    stale_after: Duration,
    batch: usize,
}

impl Reconciler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        requests: Arc<dyn RequestStore>,
        stale_after: Duration,
        batch: usize,
    ) -> Self {
        Self {
            jobs,
            requests,
            stale_after,
            batch: batch.max(1),
        }
    }

    /// One reclaim sweep. Returns how many jobs went back to `Pending`.
    pub async fn reclaim_once(&self) -> Result<usize> {
        let mut total = 0;
        for from in RECLAIMABLE {
            let moved = self
                .jobs
                .reclaim_stale(from, QueueStatus::Pending, self.stale_after)
                .await
                .with_context(|| format!("Failed to reclaim stale {} jobs", from))?;

            if !moved.is_empty() {
                let ids: Vec<i64> = moved.iter().map(|j| j.id).collect();
                warn!(from = %from, count = moved.len(), job_ids = ?ids, "Reclaimed stale jobs");
                metrics::record_reclaimed(from, moved.len());
            }
            total += moved.len();
        }
        Ok(total)
    }

    /// Runs a sweep immediately, then every `interval` until cancelled.
    pub async fn run_reclaim_loop(&self, interval: Duration, cancel: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "Reclaim loop started"
        );
        loop {
            if let Err(e) = self.reclaim_once().await {
                error!(error = %format!("{:#}", e), "Reclaim pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Reclaim loop stopped");
    }

    /// One drain pass over running, failed and finished jobs.
    ///
    /// A row whose handoff fails is left in place for the next pass.
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        let running = self
            .jobs
            .fetch_by_status(QueueStatus::Processing, self.batch)
            .await
            .context("Failed to fetch processing jobs")?;
        for job in running {
            match self.requests.mark_judging(job.request).await {
                Ok(true) => report.marked_judging += 1,
                Ok(false) => debug!(job_id = job.id, request = %job.request, "Request already has a result"),
                Err(e) => error!(job_id = job.id, request = %job.request, error = %e, "Failed to mark request judging"),
            }
        }

        let failed = self
            .jobs
            .fetch_by_status(QueueStatus::Failed, self.batch)
            .await
            .context("Failed to fetch failed jobs")?;
        for job in failed {
            if let Err(e) = self.requests.set_request_status(job.request, Severity::IE).await {
                error!(job_id = job.id, request = %job.request, error = %e, "Failed to mark request internal error");
                continue;
            }
            match self.jobs.delete_job(job.id).await {
                Ok(()) => {
                    info!(job_id = job.id, request = %job.request, "Reported failed job");
                    report.failed += 1;
                }
                Err(e) => error!(job_id = job.id, error = %e, "Failed to delete failed job"),
            }
        }

        let results = self
            .jobs
            .fetch_results(self.batch)
            .await
            .context("Failed to fetch results")?;
        for pending in results {
            let result = &pending.result;
            let Some(job) = pending.job else {
                warn!(result_id = result.id, job_id = result.job_id, "Result has no job, deleting it");
                match self.jobs.delete_result(result.id).await {
                    Ok(()) => report.orphaned += 1,
                    Err(e) => error!(result_id = result.id, error = %e, "Failed to delete orphan result"),
                }
                continue;
            };

            if let Err(e) = self.requests.apply_result(job.request, &result.result).await {
                error!(job_id = job.id, request = %job.request, error = %e, "Failed to apply result");
                continue;
            }
            if let Err(e) = self.jobs.delete_result(result.id).await {
                error!(result_id = result.id, error = %e, "Failed to delete applied result");
                continue;
            }
            if let Err(e) = self.jobs.delete_job(job.id).await {
                error!(job_id = job.id, error = %e, "Failed to delete finished job");
                continue;
            }
            debug!(job_id = job.id, request = %job.request, result = %result.result.result_id, "Applied result");
            report.applied += 1;
        }
        metrics::record_drained(report.applied);

        match self.jobs.count_by_status().await {
            Ok(counts) => metrics::set_queue_depth(&counts),
            Err(e) => warn!(error = %e, "Failed to count queue depth"),
        }

        Ok(report)
    }

    pub async fn run_drain_loop(&self, cancel: CancellationToken) {
        info!(batch = self.batch, "Drain loop started");
        loop {
            let pause = match self.drain_once().await {
                Ok(report) if report.is_busy() => {
                    debug!(?report, "Drain pass");
                    BUSY_SLEEP
                }
                Ok(_) => IDLE_SLEEP,
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Drain pass failed");
                    IDLE_SLEEP
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("Drain loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use judge_common::store::MemoryStore;
    use judge_common::{JobDetail, NewJob, RequestLog, RequestRef, ResultDetail};

    fn new_job(request: RequestRef) -> NewJob {
        NewJob {
            request,
            detail: JobDetail {
                time_ms: 1000,
                memory_mb: 64,
                ..Default::default()
            },
        }
    }

    fn reconciler(store: &MemoryStore) -> Reconciler {
        Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Duration::from_secs(600),
            100,
        )
    }

    fn accepted() -> ResultDetail {
        ResultDetail::from(RequestLog::from_task_logs(vec![], vec![]))
    }

    #[tokio::test]
    async fn test_crashed_job_is_reclaimed_exactly_once() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job(RequestRef::Grading { request_id: 4 })).await.unwrap();
        store.claim_pending(1).await.unwrap();
        store.set_status(job.id, QueueStatus::Processing).await.unwrap();
        store.backdate(job.id, chrono::Duration::minutes(11)).unwrap();

        let reconciler = reconciler(&store);
        assert_eq!(reconciler.reclaim_once().await.unwrap(), 1);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, QueueStatus::Pending);

        assert_eq!(reconciler.reclaim_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fresh_and_fetched_jobs() {
        let store = MemoryStore::new();
        let fresh = store.insert_job(new_job(RequestRef::Grading { request_id: 1 })).await.unwrap();
        let fetched = store.insert_job(new_job(RequestRef::Grading { request_id: 2 })).await.unwrap();
        store.claim_pending(2).await.unwrap();
        store.set_status(fresh.id, QueueStatus::Processing).await.unwrap();
        store.backdate(fetched.id, chrono::Duration::minutes(30)).unwrap();

        assert_eq!(reconciler(&store).reclaim_once().await.unwrap(), 1);
        assert_eq!(
            store.get_job(fresh.id).await.unwrap().unwrap().status,
            QueueStatus::Processing
        );
        assert_eq!(
            store.get_job(fetched.id).await.unwrap().unwrap().status,
            QueueStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_drain_hands_off_and_deletes() {
        let store = MemoryStore::new();
        let done = RequestRef::Validation { request_id: 1 };
        let failed = RequestRef::Grading { request_id: 2 };
        let running = RequestRef::Grading { request_id: 3 };

        let done_job = store.insert_job(new_job(done)).await.unwrap();
        let failed_job = store.insert_job(new_job(failed)).await.unwrap();
        let running_job = store.insert_job(new_job(running)).await.unwrap();
        store.claim_pending(3).await.unwrap();
        store.complete_with_result(done_job.id, accepted()).await.unwrap();
        store.set_status(failed_job.id, QueueStatus::Failed).await.unwrap();
        store.set_status(running_job.id, QueueStatus::Processing).await.unwrap();

        let report = reconciler(&store).drain_once().await.unwrap();
        assert_eq!(
            report,
            DrainReport {
                marked_judging: 1,
                failed: 1,
                applied: 1,
                orphaned: 0,
            }
        );

        let record = store.request(&done).unwrap();
        assert_eq!(record.status, Severity::AC);
        assert_eq!(record.result, Some(accepted()));
        assert_eq!(store.request(&failed).unwrap().status, Severity::IE);
        assert_eq!(store.request(&running).unwrap().status, Severity::Judging);

        assert!(store.get_job(done_job.id).await.unwrap().is_none());
        assert!(store.get_job(failed_job.id).await.unwrap().is_none());
        assert!(store.get_job(running_job.id).await.unwrap().is_some());
        assert_eq!(store.result_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_running_snapshot_keeps_applied_result() {
        let store = MemoryStore::new();
        let request = RequestRef::Grading { request_id: 6 };
        let job = store.insert_job(new_job(request)).await.unwrap();
        store.claim_pending(1).await.unwrap();
        store.start_job(job.id).await.unwrap();

        // Another host handed the result back before this pass marks the job
        store.apply_result(request, &accepted()).await.unwrap();

        let report = reconciler(&store).drain_once().await.unwrap();
        assert_eq!(report.marked_judging, 0);
        let record = store.request(&request).unwrap();
        assert_eq!(record.status, Severity::AC);
        assert_eq!(record.result, Some(accepted()));
    }

    #[tokio::test]
    async fn test_second_drain_is_a_no_op() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job(RequestRef::Validation { request_id: 9 })).await.unwrap();
        store.claim_pending(1).await.unwrap();
        store.complete_with_result(job.id, accepted()).await.unwrap();

        let reconciler = reconciler(&store);
        assert!(reconciler.drain_once().await.unwrap().is_busy());
        let second = reconciler.drain_once().await.unwrap();
        assert_eq!(second, DrainReport::default());
        assert!(!second.is_busy());
    }

    #[tokio::test]
    async fn test_orphan_result_is_deleted() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job(RequestRef::Validation { request_id: 5 })).await.unwrap();
        store.claim_pending(1).await.unwrap();
        store.complete_with_result(job.id, accepted()).await.unwrap();
        store.delete_job(job.id).await.unwrap();

        let report = reconciler(&store).drain_once().await.unwrap();
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(store.result_count(), 0);
        assert!(store.request(&RequestRef::Validation { request_id: 5 }).is_none());
    }

    #[tokio::test]
    async fn test_loops_stop_on_cancel() {
        let store = MemoryStore::new();
        let reconciler = Arc::new(reconciler(&store));
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), async {
            reconciler.run_reclaim_loop(Duration::from_secs(300), cancel.clone()).await;
            reconciler.run_drain_loop(cancel.clone()).await;
        })
        .await
        .expect("loops should exit once cancelled");
    }
}
