//! Redis-backed queue.
//!
//! Layout, all under the configured prefix `{p}`:
//!
//! - `{p}:job:seq` / `{p}:result:seq` - id sequences
//! - `{p}:job:{id}` - hash with `record` (job JSON), `status` and `updated_at` (ms)
//! - `{p}:jobs:{status}` - sorted set of job ids scored by `updated_at`
//! - `{p}:result:{id}` - hash with `job_id`, `created_at` (ms) and `detail` (JSON)
//! - `{p}:results` - sorted set of result ids
//! - `{p}:request:{kind}:{id}` - hash with `status` and `result` for the web layer
//!
//! Every state transition is one Lua script, so a job's hash and its sorted
//! set membership always move together. The scripts build job keys from a
//! prefix argument, which limits this store to a single Redis node.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use super::{chrono_duration, JobStore, RequestStore, StoreError, StoreResult};
use crate::config::Config;
use crate::status::{QueueStatus, Severity};
use crate::types::{JobQueue, NewJob, PendingResult, RequestRef, ResultDetail, ResultQueue};

const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)
local out = {}
for _, id in ipairs(ids) do
  local key = ARGV[3] .. id
  redis.call('ZREM', KEYS[1], id)
  redis.call('ZADD', KEYS[2], ARGV[2], id)
  redis.call('HSET', key, 'status', ARGV[4], 'updated_at', ARGV[2])
  table.insert(out, redis.call('HGET', key, 'record'))
end
return out
"#;

const SET_STATUS_SCRIPT: &str = r#"
local old = redis.call('HGET', KEYS[1], 'status')
if not old then
  return 0
end
redis.call('ZREM', ARGV[3] .. old, ARGV[4])
redis.call('ZADD', ARGV[3] .. ARGV[1], ARGV[2], ARGV[4])
redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updated_at', ARGV[2])
return 1
"#;

const START_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return 0
end
if status ~= 'fetched' then
  return -1
end
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[1], 'status', 'processing', 'updated_at', ARGV[1])
return 1
"#;

const COMPLETE_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return 0
end
if status == 'done' then
  return -1
end
local rid = redis.call('INCR', KEYS[2])
redis.call('HSET', ARGV[4] .. rid, 'job_id', ARGV[1], 'created_at', ARGV[2], 'detail', ARGV[5])
redis.call('ZADD', KEYS[3], rid, rid)
redis.call('ZREM', ARGV[3] .. status, ARGV[1])
redis.call('ZADD', ARGV[3] .. 'done', ARGV[2], ARGV[1])
redis.call('HSET', KEYS[1], 'status', 'done', 'updated_at', ARGV[2])
return rid
"#;

const RECLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local out = {}
for _, id in ipairs(ids) do
  local key = ARGV[3] .. id
  redis.call('ZREM', KEYS[1], id)
  redis.call('ZADD', KEYS[2], ARGV[2], id)
  redis.call('HSET', key, 'status', ARGV[4], 'updated_at', ARGV[2])
  table.insert(out, redis.call('HGET', key, 'record'))
end
return out
"#;

const MARK_JUDGING_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], 'result') == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[1])
return 1
"#;

const DELETE_JOB_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if status then
  redis.call('ZREM', ARGV[1] .. status, ARGV[2])
end
redis.call('DEL', KEYS[1])
return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    claim: Script,
    set_status: Script,
    start: Script,
    complete: Script,
    reclaim: Script,
    delete_job: Script,
    mark_judging: Script,
}

impl RedisStore {
    pub async fn connect(config: &Config) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, &config.key_prefix))
    }

    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            claim: Script::new(CLAIM_SCRIPT),
            set_status: Script::new(SET_STATUS_SCRIPT),
            start: Script::new(START_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            reclaim: Script::new(RECLAIM_SCRIPT),
            delete_job: Script::new(DELETE_JOB_SCRIPT),
            mark_judging: Script::new(MARK_JUDGING_SCRIPT),
        }
    }

    fn job_key(&self, job_id: i64) -> String {
        job_key(&self.prefix, job_id)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn status_key(&self, status: QueueStatus) -> String {
        status_key(&self.prefix, status)
    }

    fn status_key_prefix(&self) -> String {
        format!("{}:jobs:", self.prefix)
    }

    fn result_key(&self, result_id: i64) -> String {
        result_key(&self.prefix, result_id)
    }

    fn result_key_prefix(&self) -> String {
        format!("{}:result:", self.prefix)
    }

    fn results_key(&self) -> String {
        format!("{}:results", self.prefix)
    }

    /// Decode records returned by the claim and reclaim scripts, which already
    /// moved every job to `status` at `now_ms`.
    fn decode_moved(
        &self,
        records: Vec<Option<String>>,
        status: QueueStatus,
        now_ms: i64,
    ) -> StoreResult<Vec<JobQueue>> {
        let updated_at = from_millis(now_ms)?;
        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            match record {
                Some(raw) => {
                    let mut job: JobQueue = serde_json::from_str(&raw)?;
                    job.status = status;
                    job.updated_at = updated_at;
                    jobs.push(job);
                }
                None => warn!("Job hash without a record moved to {}", status),
            }
        }
        Ok(jobs)
    }

    async fn load_result(&self, result_id: i64) -> StoreResult<Option<ResultQueue>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.result_key(result_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let job_id = field(&fields, "job_id")?
            .parse::<i64>()
            .map_err(|e| StoreError::InvariantViolation(format!("result {} job_id: {}", result_id, e)))?;
        let created_at = parse_millis(field(&fields, "created_at")?)?;
        let result: ResultDetail = serde_json::from_str(field(&fields, "detail")?)?;
        Ok(Some(ResultQueue {
            id: result_id,
            job_id,
            created_at,
            result,
        }))
    }
}

pub fn job_key(prefix: &str, job_id: i64) -> String {
    format!("{}:job:{}", prefix, job_id)
}

pub fn status_key(prefix: &str, status: QueueStatus) -> String {
    format!("{}:jobs:{}", prefix, status.as_str())
}

pub fn result_key(prefix: &str, result_id: i64) -> String {
    format!("{}:result:{}", prefix, result_id)
}

pub fn request_key(prefix: &str, request: &RequestRef) -> String {
    format!("{}:request:{}:{}", prefix, request.kind(), request.request_id())
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> StoreResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::InvariantViolation(format!("record is missing field '{}'", name)))
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::InvariantViolation(format!("timestamp out of range: {}", ms)))
}

fn parse_millis(raw: &str) -> StoreResult<DateTime<Utc>> {
    let ms = raw
        .parse::<i64>()
        .map_err(|e| StoreError::InvariantViolation(format!("bad timestamp '{}': {}", raw, e)))?;
    from_millis(ms)
}

fn decode_job(fields: &HashMap<String, String>) -> StoreResult<JobQueue> {
    let mut job: JobQueue = serde_json::from_str(field(fields, "record")?)?;
    let status = field(fields, "status")?;
    job.status = status.parse::<QueueStatus>().map_err(StoreError::InvariantViolation)?;
    job.updated_at = parse_millis(field(fields, "updated_at")?)?;
    Ok(job)
}

#[async_trait]
impl JobStore for RedisStore {
    async fn insert_job(&self, job: NewJob) -> StoreResult<JobQueue> {
        let mut conn = self.conn.clone();
        let id: i64 = conn.incr(format!("{}:job:seq", self.prefix), 1).await?;
        let now = Utc::now();
        let row = JobQueue {
            id,
            request: job.request,
            status: QueueStatus::Pending,
            created_at: now,
            updated_at: now,
            detail: job.detail,
        };
        let record = serde_json::to_string(&row)?;
        let now_ms = now.timestamp_millis();

        redis::pipe()
            .atomic()
            .hset_multiple(
                self.job_key(id),
                &[
                    ("record", record),
                    ("status", QueueStatus::Pending.as_str().to_string()),
                    ("updated_at", now_ms.to_string()),
                ],
            )
            .ignore()
            .zadd(self.status_key(QueueStatus::Pending), id, now_ms)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(row)
    }

    async fn claim_pending(&self, limit: usize) -> StoreResult<Vec<JobQueue>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let records: Vec<Option<String>> = self
            .claim
            .key(self.status_key(QueueStatus::Pending))
            .key(self.status_key(QueueStatus::Fetched))
            .arg(limit)
            .arg(now_ms)
            .arg(self.job_key_prefix())
            .arg(QueueStatus::Fetched.as_str())
            .invoke_async(&mut conn)
            .await?;
        self.decode_moved(records, QueueStatus::Fetched, now_ms)
    }

    async fn set_status(&self, job_id: i64, status: QueueStatus) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .set_status
            .key(self.job_key(job_id))
            .arg(status.as_str())
            .arg(Utc::now().timestamp_millis())
            .arg(self.status_key_prefix())
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound { job_id });
        }
        Ok(())
    }

    async fn start_job(&self, job_id: i64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let started: i64 = self
            .start
            .key(self.job_key(job_id))
            .key(self.status_key(QueueStatus::Fetched))
            .key(self.status_key(QueueStatus::Processing))
            .arg(Utc::now().timestamp_millis())
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        match started {
            0 => Err(StoreError::NotFound { job_id }),
            1 => Ok(true),
            _ => Ok(false),
        }
    }

    async fn complete_with_result(&self, job_id: i64, result: ResultDetail) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let detail = serde_json::to_string(&result)?;
        let result_id: i64 = self
            .complete
            .key(self.job_key(job_id))
            .key(format!("{}:result:seq", self.prefix))
            .key(self.results_key())
            .arg(job_id)
            .arg(Utc::now().timestamp_millis())
            .arg(self.status_key_prefix())
            .arg(self.result_key_prefix())
            .arg(detail)
            .invoke_async(&mut conn)
            .await?;
        match result_id {
            0 => Err(StoreError::NotFound { job_id }),
            -1 => Err(StoreError::InvariantViolation(format!(
                "job {} already has a result",
                job_id
            ))),
            id => Ok(id),
        }
    }

    async fn reclaim_stale(
        &self,
        from: QueueStatus,
        to: QueueStatus,
        stale_after: Duration,
    ) -> StoreResult<Vec<JobQueue>> {
        let now = Utc::now();
        let cutoff_ms = (now - chrono_duration(stale_after)?).timestamp_millis();
        let now_ms = now.timestamp_millis();

        let mut conn = self.conn.clone();
        let records: Vec<Option<String>> = self
            .reclaim
            .key(self.status_key(from))
            .key(self.status_key(to))
            .arg(cutoff_ms)
            .arg(now_ms)
            .arg(self.job_key_prefix())
            .arg(to.as_str())
            .invoke_async(&mut conn)
            .await?;
        self.decode_moved(records, to, now_ms)
    }

    async fn delete_job(&self, job_id: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .delete_job
            .key(self.job_key(job_id))
            .arg(self.status_key_prefix())
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_result(&self, result_id: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(self.result_key(result_id))
            .ignore()
            .zrem(self.results_key(), result_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> StoreResult<Option<JobQueue>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(&fields).map(Some)
    }

    async fn fetch_by_status(&self, status: QueueStatus, limit: usize) -> StoreResult<Vec<JobQueue>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<i64> = conn
            .zrange(self.status_key(status), 0, limit as isize - 1)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            // Deleted between the two reads.
            if let Some(job) = self.get_job(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn fetch_results(&self, limit: usize) -> StoreResult<Vec<PendingResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<i64> = conn.zrange(self.results_key(), 0, limit as isize - 1).await?;

        let mut pending = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(result) = self.load_result(id).await? else {
                continue;
            };
            let job = self.get_job(result.job_id).await?;
            pending.push(PendingResult { result, job });
        }
        Ok(pending)
    }

    async fn count_by_status(&self) -> StoreResult<Vec<(QueueStatus, u64)>> {
        let mut conn = self.conn.clone();
        let mut counts = Vec::with_capacity(QueueStatus::ALL.len());
        for status in QueueStatus::ALL {
            let count: u64 = conn.zcard(self.status_key(status)).await?;
            counts.push((status, count));
        }
        Ok(counts)
    }
}

#[async_trait]
impl RequestStore for RedisStore {
    async fn set_request_status(&self, request: RequestRef, status: Severity) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(request_key(&self.prefix, &request), "status", i64::from(status))
            .await?;
        Ok(())
    }

    async fn mark_judging(&self, request: RequestRef) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .mark_judging
            .key(request_key(&self.prefix, &request))
            .arg(i64::from(Severity::Judging))
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn apply_result(&self, request: RequestRef, result: &ResultDetail) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(result)?;
        let _: () = conn
            .hset_multiple(
                request_key(&self.prefix, &request),
                &[
                    ("status", i64::from(result.result_id).to_string()),
                    ("result", payload),
                ],
            )
            .await?;
        Ok(())
    }
}
