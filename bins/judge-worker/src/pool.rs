//! Worker pool: one dispatcher claiming jobs, N workers executing them.

use anyhow::Result;
use judge_common::{JobQueue, JobStore, QueueStatus, ResultDetail, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::executor::SandboxExecutor;
use crate::metrics;

type SharedReceiver = Arc<Mutex<mpsc::Receiver<JobQueue>>>;

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    executor: Arc<SandboxExecutor>,
    pool_size: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<SandboxExecutor>,
        pool_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            pool_size: pool_size.max(1),
            poll_interval,
        }
    }

    /// Run until `cancel` fires, then wait for every worker to stop.
    ///
    /// Jobs still waiting in the channel at shutdown go back to `Pending`.
    /// A job interrupted mid-execution stays in `Processing` and is picked up
    /// again by stale reclamation.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel::<JobQueue>(self.pool_size * 4);
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.pool_size {
            workers.spawn(worker_loop(
                worker_id,
                rx.clone(),
                self.store.clone(),
                self.executor.clone(),
                cancel.clone(),
            ));
        }
        info!(workers = self.pool_size, "Worker pool started");

        self.dispatch(&tx, &cancel).await;
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }

        self.return_unstarted(&rx).await;
        info!("Worker pool stopped");
        Ok(())
    }

    async fn dispatch(&self, tx: &mpsc::Sender<JobQueue>, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            let jobs = match self.store.claim_pending(self.pool_size).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "Failed to claim pending jobs");
                    Vec::new()
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            metrics::record_jobs_claimed(jobs.len());
            debug!(count = jobs.len(), "Claimed jobs");

            let mut pending = jobs.into_iter();
            while let Some(job) = pending.next() {
                let job_id = job.id;
                tokio::select! {
                    sent = tx.send(job) => {
                        if sent.is_err() {
                            warn!(job_id, "Workers gone, returning job to pending");
                            self.requeue(job_id).await;
                        }
                    }
                    _ = cancel.cancelled() => {
                        self.requeue(job_id).await;
                        for job in pending.by_ref() {
                            self.requeue(job.id).await;
                        }
                        return;
                    }
                }
            }
        }
    }

    async fn return_unstarted(&self, rx: &SharedReceiver) {
        let mut rx = rx.lock().await;
        while let Ok(job) = rx.try_recv() {
            self.requeue(job.id).await;
        }
    }

    async fn requeue(&self, job_id: i64) {
        match self.store.set_status(job_id, QueueStatus::Pending).await {
            Ok(()) => debug!(job_id, "Returned unstarted job to pending"),
            Err(e) => warn!(job_id, error = %e, "Failed to return job to pending"),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: SharedReceiver,
    store: Arc<dyn JobStore>,
    executor: Arc<SandboxExecutor>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = async { rx.lock().await.recv().await } => job,
        };
        let Some(job) = job else {
            break;
        };

        // A panicking job must not take its worker down with it
        let job_id = job.id;
        let start = Instant::now();
        let run = tokio::spawn(process_job(
            worker_id,
            job,
            store.clone(),
            executor.clone(),
            cancel.clone(),
        ));
        if let Err(e) = run.await {
            error!(worker_id, job_id, error = %e, "Job task aborted");
            mark_failed(store.as_ref(), job_id, start.elapsed().as_secs_f64()).await;
        }
    }
    info!(worker_id, "Worker shutting down");
}

#[instrument(skip_all, fields(worker_id = worker_id, job_id = job.id, request = %job.request))]
async fn process_job(
    worker_id: usize,
    job: JobQueue,
    store: Arc<dyn JobStore>,
    executor: Arc<SandboxExecutor>,
    cancel: CancellationToken,
) {
    let store = store.as_ref();
    info!(
        build_tasks = job.detail.build_tasks.len(),
        judge_tasks = job.detail.judge_tasks.len(),
        time_ms = job.detail.time_ms,
        memory_mb = job.detail.memory_mb,
        "Processing job"
    );

    match store.start_job(job.id).await {
        Ok(true) => {}
        Ok(false) => {
            warn!("Job left fetched before a worker got to it, skipping");
            return;
        }
        Err(e) => {
            log_store_error(&e, "Failed to mark job processing");
            return;
        }
    }

    let start = Instant::now();
    let outcome = executor.execute(job.id, &job.detail, &cancel).await;
    let elapsed = start.elapsed().as_secs_f64();

    match outcome {
        Ok(log) => {
            let verdict = log.result_id;
            match store.complete_with_result(job.id, ResultDetail::from(log)).await {
                Ok(result_id) => {
                    metrics::record_job_finished("done", elapsed);
                    let elapsed_ms = (elapsed * 1000.0) as u64;
                    info!(result_id, result = %verdict, elapsed_ms, "Job processed successfully");
                }
                Err(StoreError::InvariantViolation(msg)) => {
                    error!(error = %msg, "Job already completed elsewhere");
                }
                Err(e) => {
                    log_store_error(&e, "Failed to store job result");
                    mark_failed(store, job.id, elapsed).await;
                }
            }
        }
        Err(failure) if cancel.is_cancelled() => {
            metrics::record_job_finished("interrupted", elapsed);
            warn!(
                tasks_completed = failure.partial.task_count(),
                "Job interrupted by shutdown, left in processing"
            );
        }
        Err(failure) => {
            error!(
                error = %format!("{:#}", failure.error),
                tasks_completed = failure.partial.task_count(),
                "Failed to execute job"
            );
            mark_failed(store, job.id, elapsed).await;
        }
    }
}

async fn mark_failed(store: &dyn JobStore, job_id: i64, elapsed: f64) {
    metrics::record_job_finished("failed", elapsed);
    if let Err(e) = store.set_status(job_id, QueueStatus::Failed).await {
        log_store_error(&e, "Failed to mark job failed");
    }
}

/// A job deleted underneath a worker is routine; anything else is not.
fn log_store_error(err: &StoreError, context: &str) {
    if err.is_not_found() {
        warn!(error = %err, "{}", context);
    } else {
        error!(error = %err, "{}", context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::executor_tests::sandbox_tests::{program, FakeExec, FakeRuntime};
    use judge_common::store::MemoryStore;
    use judge_common::{JobDetail, NewJob, RequestRef, Severity, TestCase};

    fn job_with_build(request_id: i64, dir: &std::path::Path) -> NewJob {
        NewJob {
            request: RequestRef::Grading { request_id },
            detail: JobDetail {
                time_ms: 500,
                memory_mb: 64,
                file_dir: dir.to_string_lossy().into_owned(),
                result_dir: dir.join(format!("results-{}", request_id)).to_string_lossy().into_owned(),
                build_tasks: vec![TestCase {
                    id: 1,
                    command: "make".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }

    fn executor(runtime: Arc<FakeRuntime>) -> Arc<SandboxExecutor> {
        Arc::new(SandboxExecutor::new(runtime, Arc::new(SandboxConfig::default())))
    }

    fn pool(store: &MemoryStore, runtime: Arc<FakeRuntime>, workers: usize) -> WorkerPool {
        WorkerPool::new(Arc::new(store.clone()), executor(runtime), workers, Duration::from_millis(10))
    }

    async fn wait_for(store: &MemoryStore, job_id: i64, status: QueueStatus) {
        for _ in 0..500 {
            if store.get_job(job_id).await.unwrap().map(|j| j.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", job_id, status);
    }

    #[tokio::test]
    async fn test_pool_completes_every_job_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(store.insert_job(job_with_build(i, dir.path())).await.unwrap().id);
        }
        let runtime = FakeRuntime::scripted((0..3).map(|_| program(Some(0), "")).collect());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pool(&store, runtime.clone(), 2).run(cancel.clone()));
        for id in &ids {
            wait_for(&store, *id, QueueStatus::Done).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let results = store.fetch_results(10).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.result.result.result_id == Severity::AC));
        runtime.assert_all_released();
    }

    #[tokio::test]
    async fn test_internal_error_marks_job_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let job = store.insert_job(job_with_build(1, dir.path())).await.unwrap();
        let runtime = FakeRuntime::scripted(vec![program(None, "")]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pool(&store, runtime, 2).run(cancel.clone()));
        wait_for(&store, job.id, QueueStatus::Failed).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(store.fetch_results(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_running_job_in_processing() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let job = store.insert_job(job_with_build(1, dir.path())).await.unwrap();
        let runtime = FakeRuntime::scripted(vec![FakeExec::HangUntilCancelled]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pool(&store, runtime.clone(), 2).run(cancel.clone()));
        wait_for(&store, job.id, QueueStatus::Processing).await;
        // Let the worker reach the watchdog exec
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, QueueStatus::Processing);
        runtime.assert_all_released();
    }

    #[tokio::test]
    async fn test_panicking_job_is_failed_and_worker_survives() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let bad = store.insert_job(job_with_build(1, dir.path())).await.unwrap();
        let good = store.insert_job(job_with_build(2, dir.path())).await.unwrap();
        let runtime = FakeRuntime::scripted(vec![FakeExec::Panic, program(Some(0), "")]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pool(&store, runtime.clone(), 1).run(cancel.clone()));
        wait_for(&store, bad.id, QueueStatus::Failed).await;
        // Same single worker picks up the next job
        wait_for(&store, good.id, QueueStatus::Done).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(runtime.watchdog_calls(), 2);
        assert_eq!(store.result_count(), 1);
    }

    #[tokio::test]
    async fn test_huge_limits_still_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let mut new_job = job_with_build(1, dir.path());
        new_job.detail.memory_mb = u64::MAX;
        new_job.detail.time_ms = u64::MAX;
        let job = store.insert_job(new_job).await.unwrap();
        let runtime = FakeRuntime::scripted(vec![program(Some(0), "")]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pool(&store, runtime.clone(), 1).run(cancel.clone()));
        wait_for(&store, job.id, QueueStatus::Done).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        runtime.assert_all_released();
    }

    #[tokio::test]
    async fn test_reclaimed_duplicate_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let job = store.insert_job(job_with_build(1, dir.path())).await.unwrap();

        // Claimed, left waiting in the channel past the stale threshold,
        // reclaimed and claimed again: two copies of one job
        let first = store.claim_pending(1).await.unwrap().remove(0);
        store.backdate(job.id, chrono::Duration::minutes(11)).unwrap();
        store
            .reclaim_stale(QueueStatus::Fetched, QueueStatus::Pending, Duration::from_secs(600))
            .await
            .unwrap();
        let second = store.claim_pending(1).await.unwrap().remove(0);
        assert_eq!(first.id, second.id);

        let runtime = FakeRuntime::scripted(vec![program(Some(0), "")]);
        let executor = executor(runtime.clone());
        let shared: Arc<dyn JobStore> = Arc::new(store.clone());
        let cancel = CancellationToken::new();
        process_job(0, first, shared.clone(), executor.clone(), cancel.clone()).await;
        process_job(1, second, shared, executor, cancel).await;

        assert_eq!(runtime.watchdog_calls(), 1);
        assert_eq!(store.result_count(), 1);
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().status, QueueStatus::Done);
    }
}
