use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{chrono_duration, JobStore, RequestStore, StoreError, StoreResult};
use crate::status::{QueueStatus, Severity};
use crate::types::{JobQueue, NewJob, PendingResult, RequestRef, ResultDetail, ResultQueue};

/// What the web layer would see for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub status: Severity,
    pub result: Option<ResultDetail>,
}

#[derive(Debug, Default)]
struct Data {
    jobs: BTreeMap<i64, JobQueue>,
    results: BTreeMap<i64, ResultQueue>,
    requests: HashMap<RequestRef, RequestRecord>,
    next_job_id: i64,
    next_result_id: i64,
}

/// In-process store. Every operation holds one lock for its whole duration,
/// which gives the same atomicity the Redis scripts give.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    conn: Arc<Mutex<Data>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, Data> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shift a job's `updated_at` into the past, as if its worker had
    /// stopped touching it `by` ago.
    pub fn backdate(&self, job_id: i64, by: chrono::Duration) -> StoreResult<()> {
        let mut data = self.data();
        let job = data.jobs.get_mut(&job_id).ok_or(StoreError::NotFound { job_id })?;
        job.updated_at = job.updated_at - by;
        Ok(())
    }

    pub fn request(&self, request: &RequestRef) -> Option<RequestRecord> {
        self.data().requests.get(request).cloned()
    }

    pub fn result_count(&self) -> usize {
        self.data().results.len()
    }
}

fn sorted_by_age<'a>(jobs: impl Iterator<Item = &'a JobQueue>, status: QueueStatus) -> Vec<i64> {
    let mut matching: Vec<&JobQueue> = jobs.filter(|j| j.status == status).collect();
    matching.sort_by_key(|j| (j.updated_at, j.id));
    matching.into_iter().map(|j| j.id).collect()
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: NewJob) -> StoreResult<JobQueue> {
        let mut data = self.data();
        data.next_job_id += 1;
        let now = Utc::now();
        let row = JobQueue {
            id: data.next_job_id,
            request: job.request,
            status: QueueStatus::Pending,
            created_at: now,
            updated_at: now,
            detail: job.detail,
        };
        data.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn claim_pending(&self, limit: usize) -> StoreResult<Vec<JobQueue>> {
        let mut data = self.data();
        let now = Utc::now();
        let ids = sorted_by_age(data.jobs.values(), QueueStatus::Pending);

        let mut claimed = Vec::new();
        for id in ids.into_iter().take(limit) {
            if let Some(job) = data.jobs.get_mut(&id) {
                job.status = QueueStatus::Fetched;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn set_status(&self, job_id: i64, status: QueueStatus) -> StoreResult<()> {
        let mut data = self.data();
        let job = data.jobs.get_mut(&job_id).ok_or(StoreError::NotFound { job_id })?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn start_job(&self, job_id: i64) -> StoreResult<bool> {
        let mut data = self.data();
        let job = data.jobs.get_mut(&job_id).ok_or(StoreError::NotFound { job_id })?;
        if job.status != QueueStatus::Fetched {
            return Ok(false);
        }
        job.status = QueueStatus::Processing;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete_with_result(&self, job_id: i64, result: ResultDetail) -> StoreResult<i64> {
        let mut data = self.data();
        let now = Utc::now();
        match data.jobs.get(&job_id) {
            None => return Err(StoreError::NotFound { job_id }),
            Some(job) if job.status == QueueStatus::Done => {
                return Err(StoreError::InvariantViolation(format!(
                    "job {} already has a result",
                    job_id
                )))
            }
            Some(_) => {}
        }

        data.next_result_id += 1;
        let result_id = data.next_result_id;
        data.results.insert(
            result_id,
            ResultQueue {
                id: result_id,
                job_id,
                created_at: now,
                result,
            },
        );
        if let Some(job) = data.jobs.get_mut(&job_id) {
            job.status = QueueStatus::Done;
            job.updated_at = now;
        }
        Ok(result_id)
    }

    async fn reclaim_stale(
        &self,
        from: QueueStatus,
        to: QueueStatus,
        stale_after: Duration,
    ) -> StoreResult<Vec<JobQueue>> {
        let cutoff = Utc::now() - chrono_duration(stale_after)?;
        let mut data = self.data();
        let now = Utc::now();

        let mut moved = Vec::new();
        for id in sorted_by_age(data.jobs.values(), from) {
            if let Some(job) = data.jobs.get_mut(&id) {
                if job.updated_at < cutoff {
                    job.status = to;
                    job.updated_at = now;
                    moved.push(job.clone());
                }
            }
        }
        Ok(moved)
    }

    async fn delete_job(&self, job_id: i64) -> StoreResult<()> {
        self.data().jobs.remove(&job_id);
        Ok(())
    }

    async fn delete_result(&self, result_id: i64) -> StoreResult<()> {
        self.data().results.remove(&result_id);
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> StoreResult<Option<JobQueue>> {
        Ok(self.data().jobs.get(&job_id).cloned())
    }

    async fn fetch_by_status(&self, status: QueueStatus, limit: usize) -> StoreResult<Vec<JobQueue>> {
        let data = self.data();
        Ok(sorted_by_age(data.jobs.values(), status)
            .into_iter()
            .take(limit)
            .filter_map(|id| data.jobs.get(&id).cloned())
            .collect())
    }

    async fn fetch_results(&self, limit: usize) -> StoreResult<Vec<PendingResult>> {
        let data = self.data();
        Ok(data
            .results
            .values()
            .take(limit)
            .map(|result| PendingResult {
                job: data.jobs.get(&result.job_id).cloned(),
                result: result.clone(),
            })
            .collect())
    }

    async fn count_by_status(&self) -> StoreResult<Vec<(QueueStatus, u64)>> {
        let data = self.data();
        Ok(QueueStatus::ALL
            .iter()
            .map(|status| {
                let count = data.jobs.values().filter(|j| j.status == *status).count();
                (*status, count as u64)
            })
            .collect())
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn set_request_status(&self, request: RequestRef, status: Severity) -> StoreResult<()> {
        let mut data = self.data();
        let record = data.requests.entry(request).or_insert(RequestRecord {
            status,
            result: None,
        });
        record.status = status;
        Ok(())
    }

    async fn mark_judging(&self, request: RequestRef) -> StoreResult<bool> {
        let mut data = self.data();
        let record = data.requests.entry(request).or_insert(RequestRecord {
            status: Severity::Judging,
            result: None,
        });
        if record.result.is_some() {
            return Ok(false);
        }
        record.status = Severity::Judging;
        Ok(true)
    }

    async fn apply_result(&self, request: RequestRef, result: &ResultDetail) -> StoreResult<()> {
        self.data().requests.insert(
            request,
            RequestRecord {
                status: result.result_id,
                result: Some(result.clone()),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobDetail, RequestLog};
    use std::collections::HashSet;

    fn new_job(request_id: i64) -> NewJob {
        NewJob {
            request: RequestRef::Validation { request_id },
            detail: JobDetail {
                time_ms: 1000,
                memory_mb: 64,
                file_dir: "/tmp/files".to_string(),
                result_dir: "/tmp/results".to_string(),
                ..Default::default()
            },
        }
    }

    fn accepted() -> ResultDetail {
        ResultDetail::from(RequestLog::from_task_logs(vec![], vec![]))
    }

    #[tokio::test]
    async fn test_claim_flips_to_fetched_oldest_first() {
        let store = MemoryStore::new();
        let first = store.insert_job(new_job(1)).await.unwrap();
        let second = store.insert_job(new_job(2)).await.unwrap();
        store.backdate(second.id, chrono::Duration::seconds(30)).unwrap();

        let claimed = store.claim_pending(1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, second.id);
        assert_eq!(claimed[0].status, QueueStatus::Fetched);

        let claimed = store.claim_pending(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first.id);
        assert!(store.claim_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store.insert_job(new_job(i)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_pending(4).await.unwrap() }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for job in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(job.id), "job {} claimed twice", job.id);
            }
        }
        // min(workers * limit, pending)
        assert_eq!(total, 25);
    }

    #[tokio::test]
    async fn test_set_status_on_missing_job_is_not_found() {
        let store = MemoryStore::new();
        let err = store.set_status(99, QueueStatus::Processing).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_start_job_only_from_fetched() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job(1)).await.unwrap();
        assert!(!store.start_job(job.id).await.unwrap());

        store.claim_pending(1).await.unwrap();
        assert!(store.start_job(job.id).await.unwrap());
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().status, QueueStatus::Processing);
        // Second worker holding the same job loses
        assert!(!store.start_job(job.id).await.unwrap());

        assert!(store.start_job(99).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_complete_twice_is_invariant_violation() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job(1)).await.unwrap();
        store.set_status(job.id, QueueStatus::Processing).await.unwrap();

        let result_id = store.complete_with_result(job.id, accepted()).await.unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().status, QueueStatus::Done);
        assert_eq!(store.result_count(), 1);

        let err = store.complete_with_result(job.id, accepted()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
        assert_eq!(store.result_count(), 1);

        let pending = store.fetch_results(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].result.id, result_id);
        assert_eq!(pending[0].job.as_ref().map(|j| j.id), Some(job.id));
    }

    #[tokio::test]
    async fn test_stale_processing_job_is_reclaimed_once() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job(1)).await.unwrap();
        store.claim_pending(1).await.unwrap();
        store.set_status(job.id, QueueStatus::Processing).await.unwrap();
        store.backdate(job.id, chrono::Duration::minutes(11)).unwrap();

        let stale_after = Duration::from_secs(600);
        let moved = store
            .reclaim_stale(QueueStatus::Processing, QueueStatus::Pending, stale_after)
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].status, QueueStatus::Pending);

        let again = store
            .reclaim_stale(QueueStatus::Processing, QueueStatus::Pending, stale_after)
            .await
            .unwrap();
        assert!(again.is_empty());

        let claimed = store.claim_pending(1).await.unwrap();
        assert_eq!(claimed[0].id, job.id);
    }

    #[tokio::test]
    async fn test_fresh_jobs_are_not_reclaimed() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job(1)).await.unwrap();
        store.set_status(job.id, QueueStatus::Processing).await.unwrap();

        let moved = store
            .reclaim_stale(QueueStatus::Processing, QueueStatus::Pending, Duration::from_secs(600))
            .await
            .unwrap();
        assert!(moved.is_empty());
    }

    #[tokio::test]
    async fn test_deletes_are_idempotent() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job(1)).await.unwrap();
        let result_id = store.complete_with_result(job.id, accepted()).await.unwrap();

        store.delete_result(result_id).await.unwrap();
        store.delete_result(result_id).await.unwrap();
        store.delete_job(job.id).await.unwrap();
        store.delete_job(job.id).await.unwrap();
        assert!(store.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_result_has_no_job() {
        let store = MemoryStore::new();
        let job = store.insert_job(new_job(1)).await.unwrap();
        store.complete_with_result(job.id, accepted()).await.unwrap();
        store.delete_job(job.id).await.unwrap();

        let pending = store.fetch_results(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].job.is_none());
    }

    #[tokio::test]
    async fn test_count_by_status_lists_every_status() {
        let store = MemoryStore::new();
        store.insert_job(new_job(1)).await.unwrap();
        store.insert_job(new_job(2)).await.unwrap();
        store.claim_pending(1).await.unwrap();

        let counts: HashMap<QueueStatus, u64> = store.count_by_status().await.unwrap().into_iter().collect();
        assert_eq!(counts.len(), QueueStatus::ALL.len());
        assert_eq!(counts[&QueueStatus::Pending], 1);
        assert_eq!(counts[&QueueStatus::Fetched], 1);
        assert_eq!(counts[&QueueStatus::Done], 0);
    }

    #[tokio::test]
    async fn test_request_updates_overwrite() {
        let store = MemoryStore::new();
        let request = RequestRef::Grading { request_id: 5 };
        store.set_request_status(request, Severity::Judging).await.unwrap();
        assert_eq!(store.request(&request).unwrap().status, Severity::Judging);

        let result = accepted();
        store.apply_result(request, &result).await.unwrap();
        store.apply_result(request, &result).await.unwrap();
        let record = store.request(&request).unwrap();
        assert_eq!(record.status, Severity::AC);
        assert_eq!(record.result, Some(result));
    }

    #[tokio::test]
    async fn test_mark_judging_never_hides_a_result() {
        let store = MemoryStore::new();
        let request = RequestRef::Validation { request_id: 8 };
        assert!(store.mark_judging(request).await.unwrap());
        assert_eq!(store.request(&request).unwrap().status, Severity::Judging);

        let result = accepted();
        store.apply_result(request, &result).await.unwrap();
        assert!(!store.mark_judging(request).await.unwrap());
        let record = store.request(&request).unwrap();
        assert_eq!(record.status, Severity::AC);
        assert_eq!(record.result, Some(result));
    }
}
