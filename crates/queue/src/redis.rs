//! Redis-backed queue: waiting list, delayed sorted set, active list and
//! per-job JSON bodies. Survives process restarts; leftover active jobs are
//! reclaimed at startup.

use crate::job::{DispatchJob, QueueCounts, QueuedJob, RetryPolicy};
use crate::queue::{DispatchQueue, QueueError};
use chrono::Utc;
use mailforge_core::id::{BatchId, JobId};
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tracing::debug;

const WAITING_KEY: &str = "mailforge:queue:waiting";
const DELAYED_KEY: &str = "mailforge:queue:delayed";
const ACTIVE_KEY: &str = "mailforge:queue:active";
const FAILED_KEY: &str = "mailforge:queue:failed";
const COMPLETED_KEY: &str = "mailforge:queue:completed";
const JOB_KEY_PREFIX: &str = "mailforge:queue:job:";

/// How many delayed jobs are promoted per claim poll.
const PROMOTE_BATCH: usize = 100;
/// How many failed job ids are kept for inspection.
const FAILED_KEEP: isize = 1000;
/// Failed job bodies expire after a week.
const FAILED_TTL_SECS: u64 = 7 * 24 * 60 * 60;

fn job_key(id: JobId) -> String {
    format!("{JOB_KEY_PREFIX}{id}")
}

#[derive(Clone)]
pub struct RedisQueue {
    conn: MultiplexedConnection,
    retry: RetryPolicy,
}

impl RedisQueue {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(QueueError::connection)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::connection)?;
        Ok(Self {
            conn,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Requeue jobs left in the active list by a previous process. Called
    /// once at startup, before the worker begins claiming.
    pub async fn reclaim_active(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(ACTIVE_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::command)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(ACTIVE_KEY).ignore();
        for id in &ids {
            // Reclaimed jobs go to the claim end so they run before new work.
            pipe.cmd("RPUSH").arg(WAITING_KEY).arg(id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(QueueError::command)?;
        debug!(count = ids.len(), "reclaimed active jobs from previous run");
        Ok(ids.len())
    }

    async fn load(&self, id: &str) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("GET")
            .arg(format!("{JOB_KEY_PREFIX}{id}"))
            .query_async(&mut conn)
            .await
            .map_err(QueueError::command)?;
        match body {
            Some(body) => {
                let job = serde_json::from_str(&body).map_err(QueueError::serialization)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn promote_due(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(DELAYED_KEY)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::command)?;
        if due.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &due {
            pipe.cmd("ZREM").arg(DELAYED_KEY).arg(id).ignore();
            pipe.cmd("LPUSH").arg(WAITING_KEY).arg(id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(QueueError::command)?;
        debug!(count = due.len(), "promoted delayed jobs");
        Ok(())
    }

    /// Rewrite a claimed job's body and park it in the delayed set.
    async fn park(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let body = serde_json::to_string(job).map_err(QueueError::serialization)?;
        let id = job.id.to_string();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET").arg(job_key(job.id)).arg(&body).ignore();
        pipe.cmd("LREM").arg(ACTIVE_KEY).arg(0).arg(&id).ignore();
        pipe.cmd("ZADD")
            .arg(DELAYED_KEY)
            .arg(job.available_at.timestamp_millis())
            .arg(&id)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(QueueError::command)
    }
}

#[async_trait::async_trait]
impl DispatchQueue for RedisQueue {
    async fn enqueue(&self, job: DispatchJob, delay: Option<Duration>) -> Result<JobId, QueueError> {
        let queued = QueuedJob::new(job, delay);
        let body = serde_json::to_string(&queued).map_err(QueueError::serialization)?;
        let id = queued.id.to_string();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET").arg(job_key(queued.id)).arg(&body).ignore();
        if delay.is_some() {
            pipe.cmd("ZADD")
                .arg(DELAYED_KEY)
                .arg(queued.available_at.timestamp_millis())
                .arg(&id)
                .ignore();
        } else {
            pipe.cmd("LPUSH").arg(WAITING_KEY).arg(&id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(QueueError::command)?;
        Ok(queued.id)
    }

    async fn claim_next(&self) -> Result<Option<QueuedJob>, QueueError> {
        self.promote_due().await?;
        let mut conn = self.conn.clone();
        loop {
            let id: Option<String> = redis::cmd("LMOVE")
                .arg(WAITING_KEY)
                .arg(ACTIVE_KEY)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .map_err(QueueError::command)?;
            let Some(id) = id else {
                return Ok(None);
            };
            match self.load(&id).await? {
                Some(job) => return Ok(Some(job)),
                None => {
                    // Body purged while the id sat in the waiting list; drop
                    // the orphan and try the next one.
                    redis::cmd("LREM")
                        .arg(ACTIVE_KEY)
                        .arg(0)
                        .arg(&id)
                        .query_async::<_, ()>(&mut conn)
                        .await
                        .map_err(QueueError::command)?;
                }
            }
        }
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("LREM")
            .arg(ACTIVE_KEY)
            .arg(0)
            .arg(job.id.to_string())
            .ignore();
        pipe.cmd("DEL").arg(job_key(job.id)).ignore();
        pipe.cmd("INCR").arg(COMPLETED_KEY).ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(QueueError::command)
    }

    async fn release(&self, job: &QueuedJob, delay: Duration) -> Result<(), QueueError> {
        let mut updated = job.clone();
        updated.available_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.park(&updated).await
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<(), QueueError> {
        let mut updated = job.clone();
        updated.attempts += 1;
        updated.last_error = Some(error.to_string());

        if self.retry.should_retry(updated.attempts) {
            let delay = self.retry.delay_for_attempt(updated.attempts);
            updated.available_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            return self.park(&updated).await;
        }

        let body = serde_json::to_string(&updated).map_err(QueueError::serialization)?;
        let id = updated.id.to_string();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SET")
            .arg(job_key(updated.id))
            .arg(&body)
            .arg("EX")
            .arg(FAILED_TTL_SECS)
            .ignore();
        pipe.cmd("LREM").arg(ACTIVE_KEY).arg(0).arg(&id).ignore();
        pipe.cmd("LPUSH").arg(FAILED_KEY).arg(&id).ignore();
        pipe.cmd("LTRIM").arg(FAILED_KEY).arg(0).arg(FAILED_KEEP - 1).ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(QueueError::command)
    }

    async fn remove_for_batch(&self, batch_id: BatchId) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let waiting: Vec<String> = redis::cmd("LRANGE")
            .arg(WAITING_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::command)?;
        let delayed: Vec<String> = redis::cmd("ZRANGE")
            .arg(DELAYED_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::command)?;

        let mut removed = 0usize;
        for id in &waiting {
            if let Some(job) = self.load(id).await? {
                if job.payload.batch_id == batch_id {
                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.cmd("LREM").arg(WAITING_KEY).arg(0).arg(id).ignore();
                    pipe.cmd("DEL").arg(format!("{JOB_KEY_PREFIX}{id}")).ignore();
                    pipe.query_async::<_, ()>(&mut conn)
                        .await
                        .map_err(QueueError::command)?;
                    removed += 1;
                }
            }
        }
        for id in &delayed {
            if let Some(job) = self.load(id).await? {
                if job.payload.batch_id == batch_id {
                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.cmd("ZREM").arg(DELAYED_KEY).arg(id).ignore();
                    pipe.cmd("DEL").arg(format!("{JOB_KEY_PREFIX}{id}")).ignore();
                    pipe.query_async::<_, ()>(&mut conn)
                        .await
                        .map_err(QueueError::command)?;
                    removed += 1;
                }
            }
        }
        debug!(%batch_id, removed, "removed queued jobs for batch");
        Ok(removed)
    }

    async fn pending_for_batch(&self, batch_id: BatchId) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, active): (Vec<String>, Vec<String>, Vec<String>) = redis::pipe()
            .cmd("LRANGE").arg(WAITING_KEY).arg(0).arg(-1)
            .cmd("ZRANGE").arg(DELAYED_KEY).arg(0).arg(-1)
            .cmd("LRANGE").arg(ACTIVE_KEY).arg(0).arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::command)?;

        let mut pending = 0usize;
        for id in waiting.iter().chain(delayed.iter()).chain(active.iter()) {
            if let Some(job) = self.load(id).await? {
                if job.payload.batch_id == batch_id {
                    pending += 1;
                }
            }
        }
        Ok(pending)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, failed, completed): (u64, u64, u64, u64, Option<u64>) =
            redis::pipe()
                .cmd("LLEN").arg(WAITING_KEY)
                .cmd("ZCARD").arg(DELAYED_KEY)
                .cmd("LLEN").arg(ACTIVE_KEY)
                .cmd("LLEN").arg(FAILED_KEY)
                .cmd("GET").arg(COMPLETED_KEY)
                .query_async(&mut conn)
                .await
                .map_err(QueueError::command)?;
        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed: completed.unwrap_or(0),
            failed,
        })
    }
}
