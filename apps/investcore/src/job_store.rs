use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CoreError;
use crate::retry::backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn is_leasable(self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub dedupe_key: Option<String>,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub error_message: Option<String>,
    pub progress: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Returns the existing job id if `dedupe_key` collides with a
    /// non-terminal job (§4.A).
    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        dedupe_key: Option<&str>,
        max_attempts: u32,
    ) -> Result<Job, CoreError>;

    /// Atomically flips up to `max_n` leasable jobs to `running` with a
    /// lease expiration, served in `(next_retry_at, created_at)` order.
    async fn lease(
        &self,
        worker_id: &str,
        max_n: usize,
        lease_ttl: chrono::Duration,
    ) -> Result<Vec<Job>, CoreError>;

    async fn complete(
        &self,
        job_id: Uuid,
        progress_patch: Value,
    ) -> Result<Job, CoreError>;

    /// Merges `progress_patch` into the job's progress without changing its
    /// status, so multi-step handlers (wallet fan-out) durably record
    /// partial progress before a terminal `complete`/`fail` decision.
    async fn save_progress(&self, job_id: Uuid, progress_patch: Value) -> Result<Job, CoreError>;

    /// Increments `attempt_count`; schedules a retry with exponential
    /// backoff+jitter if `retryable` and attempts remain, else fails
    /// terminally.
    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retryable: bool,
        backoff_base_seconds: u64,
        backoff_cap_seconds: u64,
    ) -> Result<Job, CoreError>;

    /// Returns any leased job whose lease has expired to `retrying` with a
    /// penalty attempt, so a dead worker's jobs are eventually re-driven.
    async fn reap_expired(&self) -> Result<Vec<Job>, CoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, CoreError>;

    /// Releases a leased job immediately (used on context cancellation /
    /// shutdown rather than waiting out the lease).
    async fn release(&self, job_id: Uuid) -> Result<(), CoreError>;
}

pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        dedupe_key: Option<&str>,
        max_attempts: u32,
    ) -> Result<Job, CoreError> {
        let mut jobs = self.jobs.lock().await;

        if let Some(key) = dedupe_key {
            if let Some(existing) = jobs
                .values()
                .find(|j| j.dedupe_key.as_deref() == Some(key) && !j.status.is_terminal())
            {
                return Ok(existing.clone());
            }
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            dedupe_key: dedupe_key.map(str::to_string),
            status: JobStatus::Queued,
            attempt_count: 0,
            max_attempts,
            next_retry_at: now,
            lease_expires_at: None,
            leased_by: None,
            error_message: None,
            progress: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        };
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_n: usize,
        lease_ttl: chrono::Duration,
    ) -> Result<Vec<Job>, CoreError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.status.is_leasable() && j.next_retry_at <= now)
            .map(|j| j.id)
            .collect();
        candidates.sort_by_key(|id| {
            let j = &jobs[id];
            (j.next_retry_at, j.created_at)
        });
        candidates.truncate(max_n);

        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.leased_by = Some(worker_id.to_string());
                job.lease_expires_at = Some(now + lease_ttl);
                job.updated_at = now;
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn complete(&self, job_id: Uuid, progress_patch: Value) -> Result<Job, CoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        job.status = JobStatus::Succeeded;
        merge_progress(&mut job.progress, progress_patch);
        job.lease_expires_at = None;
        job.leased_by = None;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn save_progress(&self, job_id: Uuid, progress_patch: Value) -> Result<Job, CoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        merge_progress(&mut job.progress, progress_patch);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retryable: bool,
        backoff_base_seconds: u64,
        backoff_cap_seconds: u64,
    ) -> Result<Job, CoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        job.attempt_count += 1;
        job.error_message = Some(error.to_string());
        job.lease_expires_at = None;
        job.leased_by = None;
        job.updated_at = Utc::now();

        if retryable && job.attempt_count < job.max_attempts {
            job.status = JobStatus::Retrying;
            job.next_retry_at = Utc::now()
                + ChronoDuration::from_std(backoff(
                    job.attempt_count,
                    backoff_base_seconds,
                    backoff_cap_seconds,
                ))
                .unwrap_or_default();
        } else {
            job.status = JobStatus::Failed;
        }
        Ok(job.clone())
    }

    async fn reap_expired(&self) -> Result<Vec<Job>, CoreError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let mut reaped = Vec::new();
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running {
                if let Some(expires) = job.lease_expires_at {
                    if expires <= now {
                        job.status = JobStatus::Retrying;
                        job.attempt_count += 1;
                        job.next_retry_at = now;
                        job.lease_expires_at = None;
                        job.leased_by = None;
                        job.updated_at = now;
                        reaped.push(job.clone());
                    }
                }
            }
        }
        Ok(reaped)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, CoreError> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn release(&self, job_id: Uuid) -> Result<(), CoreError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Retrying;
                job.next_retry_at = Utc::now();
                job.lease_expires_at = None;
                job.leased_by = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }
}

fn merge_progress(current: &mut Value, patch: Value) {
    match (current, patch) {
        (Value::Object(current), Value::Object(patch)) => {
            for (key, value) in patch {
                current.insert(key, value);
            }
        }
        (slot, patch) => *slot = patch,
    }
}

pub struct PostgresJobStore {
    db: Arc<crate::db::InvestDb>,
}

impl PostgresJobStore {
    pub fn new(db: Arc<crate::db::InvestDb>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        dedupe_key: Option<&str>,
        max_attempts: u32,
    ) -> Result<Job, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;

        if let Some(key) = dedupe_key {
            let existing = client
                .query_opt(
                    r#"
                    SELECT id, job_type, payload, dedupe_key, status, attempt_count,
                           max_attempts, next_retry_at, lease_expires_at, leased_by,
                           error_message, progress, created_at, updated_at
                      FROM jobs
                     WHERE dedupe_key = $1 AND status NOT IN ('succeeded', 'failed')
                    "#,
                    &[&key],
                )
                .await
                .map_err(|error| CoreError::Internal(format!("job dedupe lookup failed: {error}")))?;
            if let Some(row) = existing {
                return Ok(map_job_row(&row));
            }
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        client
            .execute(
                r#"
                INSERT INTO jobs (
                    id, job_type, payload, dedupe_key, status, attempt_count, max_attempts,
                    next_retry_at, progress, created_at, updated_at
                ) VALUES ($1,$2,$3,$4,'queued',0,$5,$6,'{}'::jsonb,$6,$6)
                "#,
                &[&id, &job_type, &payload, &dedupe_key, &(max_attempts as i32), &now],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("job insert failed: {error}")))?;

        Ok(Job {
            id,
            job_type: job_type.to_string(),
            payload,
            dedupe_key: dedupe_key.map(str::to_string),
            status: JobStatus::Queued,
            attempt_count: 0,
            max_attempts,
            next_retry_at: now,
            lease_expires_at: None,
            leased_by: None,
            error_message: None,
            progress: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        })
    }

    async fn lease(
        &self,
        worker_id: &str,
        max_n: usize,
        lease_ttl: chrono::Duration,
    ) -> Result<Vec<Job>, CoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("lease tx failed: {error}")))?;

        let now = Utc::now();
        let lease_expires = now + lease_ttl;
        let rows = tx
            .query(
                r#"
                UPDATE jobs
                   SET status = 'running', leased_by = $1, lease_expires_at = $2, updated_at = $3
                 WHERE id IN (
                    SELECT id FROM jobs
                     WHERE status IN ('queued', 'retrying') AND next_retry_at <= $3
                     ORDER BY next_retry_at, created_at
                     LIMIT $4
                     FOR UPDATE SKIP LOCKED
                 )
                RETURNING id, job_type, payload, dedupe_key, status, attempt_count,
                          max_attempts, next_retry_at, lease_expires_at, leased_by,
                          error_message, progress, created_at, updated_at
                "#,
                &[&worker_id, &lease_expires, &now, &(max_n as i64)],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("lease query failed: {error}")))?;

        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("lease commit failed: {error}")))?;

        Ok(rows.iter().map(map_job_row).collect())
    }

    async fn complete(&self, job_id: Uuid, progress_patch: Value) -> Result<Job, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                UPDATE jobs
                   SET status = 'succeeded',
                       progress = progress || $2,
                       lease_expires_at = NULL,
                       leased_by = NULL,
                       updated_at = $3
                 WHERE id = $1
                RETURNING id, job_type, payload, dedupe_key, status, attempt_count,
                          max_attempts, next_retry_at, lease_expires_at, leased_by,
                          error_message, progress, created_at, updated_at
                "#,
                &[&job_id, &progress_patch, &Utc::now()],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("job complete failed: {error}")))?;
        Ok(map_job_row(&row))
    }

    async fn save_progress(&self, job_id: Uuid, progress_patch: Value) -> Result<Job, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                UPDATE jobs
                   SET progress = progress || $2, updated_at = $3
                 WHERE id = $1
                RETURNING id, job_type, payload, dedupe_key, status, attempt_count,
                          max_attempts, next_retry_at, lease_expires_at, leased_by,
                          error_message, progress, created_at, updated_at
                "#,
                &[&job_id, &progress_patch, &Utc::now()],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("job progress save failed: {error}")))?;
        Ok(map_job_row(&row))
    }

    async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        retryable: bool,
        backoff_base_seconds: u64,
        backoff_cap_seconds: u64,
    ) -> Result<Job, CoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| CoreError::Internal(format!("fail tx failed: {e}")))?;

        let row = tx
            .query_one("SELECT attempt_count, max_attempts FROM jobs WHERE id = $1", &[&job_id])
            .await
            .map_err(|e| CoreError::Internal(format!("fail lookup failed: {e}")))?;
        let attempt_count: i32 = row.get("attempt_count");
        let max_attempts: i32 = row.get("max_attempts");
        let next_attempt = attempt_count + 1;

        let (status, next_retry_at) = if retryable && next_attempt < max_attempts {
            let delay = backoff(next_attempt as u32, backoff_base_seconds, backoff_cap_seconds);
            (
                "retrying",
                Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default(),
            )
        } else {
            ("failed", Utc::now())
        };

        let row = tx
            .query_one(
                r#"
                UPDATE jobs
                   SET attempt_count = $2, status = $3, next_retry_at = $4,
                       error_message = $5, lease_expires_at = NULL, leased_by = NULL,
                       updated_at = $6
                 WHERE id = $1
                RETURNING id, job_type, payload, dedupe_key, status, attempt_count,
                          max_attempts, next_retry_at, lease_expires_at, leased_by,
                          error_message, progress, created_at, updated_at
                "#,
                &[&job_id, &next_attempt, &status, &next_retry_at, &error, &Utc::now()],
            )
            .await
            .map_err(|e| CoreError::Internal(format!("fail update failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| CoreError::Internal(format!("fail commit failed: {e}")))?;
        Ok(map_job_row(&row))
    }

    async fn reap_expired(&self) -> Result<Vec<Job>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let now = Utc::now();
        let rows = client
            .query(
                r#"
                UPDATE jobs
                   SET status = 'retrying', attempt_count = attempt_count + 1,
                       next_retry_at = $1, lease_expires_at = NULL, leased_by = NULL,
                       updated_at = $1
                 WHERE status = 'running' AND lease_expires_at <= $1
                RETURNING id, job_type, payload, dedupe_key, status, attempt_count,
                          max_attempts, next_retry_at, lease_expires_at, leased_by,
                          error_message, progress, created_at, updated_at
                "#,
                &[&now],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("reap failed: {error}")))?;
        Ok(rows.iter().map(map_job_row).collect())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT id, job_type, payload, dedupe_key, status, attempt_count,
                       max_attempts, next_retry_at, lease_expires_at, leased_by,
                       error_message, progress, created_at, updated_at
                  FROM jobs WHERE id = $1
                "#,
                &[&job_id],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("job lookup failed: {error}")))?;
        Ok(row.as_ref().map(map_job_row))
    }

    async fn release(&self, job_id: Uuid) -> Result<(), CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                UPDATE jobs SET status = 'retrying', next_retry_at = $2,
                       lease_expires_at = NULL, leased_by = NULL, updated_at = $2
                 WHERE id = $1 AND status = 'running'
                "#,
                &[&job_id, &Utc::now()],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("job release failed: {error}")))?;
        Ok(())
    }
}

fn map_job_row(row: &tokio_postgres::Row) -> Job {
    let status_str: String = row.get("status");
    let status = match status_str.as_str() {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "retrying" => JobStatus::Retrying,
        "succeeded" => JobStatus::Succeeded,
        _ => JobStatus::Failed,
    };
    Job {
        id: row.get("id"),
        job_type: row.get("job_type"),
        payload: row.get("payload"),
        dedupe_key: row.get("dedupe_key"),
        status,
        attempt_count: row.get::<_, i32>("attempt_count") as u32,
        max_attempts: row.get::<_, i32>("max_attempts") as u32,
        next_retry_at: row.get("next_retry_at"),
        lease_expires_at: row.get("lease_expires_at"),
        leased_by: row.get("leased_by"),
        error_message: row.get("error_message"),
        progress: row.get("progress"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedupe_returns_same_job_id_while_non_terminal() {
        let store = MemoryJobStore::new();
        let a = store
            .enqueue("wallet_provision", serde_json::json!({}), Some("user-1"), 5)
            .await
            .unwrap();
        let b = store
            .enqueue("wallet_provision", serde_json::json!({}), Some("user-1"), 5)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn enqueue_lease_complete_round_trips_payload() {
        let store = MemoryJobStore::new();
        let payload = serde_json::json!({"user_id": "u1", "chains": ["SOL-DEVNET"]});
        let job = store
            .enqueue("wallet_provision", payload.clone(), None, 5)
            .await
            .unwrap();

        let leased = store
            .lease("worker-1", 10, chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].payload, payload);
        assert_eq!(leased[0].status, JobStatus::Running);

        let completed = store
            .complete(job.id, serde_json::json!({"done": true}))
            .await
            .unwrap();
        assert_eq!(completed.status, JobStatus::Succeeded);
        assert_eq!(completed.payload, payload);
    }

    #[tokio::test]
    async fn fail_retryable_schedules_backoff_until_max_attempts() {
        let store = MemoryJobStore::new();
        let job = store
            .enqueue("wallet_provision", serde_json::json!({}), None, 2)
            .await
            .unwrap();

        let after_first = store.fail(job.id, "transient", true, 30, 1_800).await.unwrap();
        assert_eq!(after_first.status, JobStatus::Retrying);

        let after_second = store.fail(job.id, "transient", true, 30, 1_800).await.unwrap();
        assert_eq!(after_second.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn reap_expired_returns_lease_to_retrying() {
        let store = MemoryJobStore::new();
        let job = store
            .enqueue("wallet_provision", serde_json::json!({}), None, 5)
            .await
            .unwrap();
        store
            .lease("worker-1", 10, chrono::Duration::milliseconds(-1))
            .await
            .unwrap();

        let reaped = store.reap_expired().await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, job.id);
        assert_eq!(reaped[0].status, JobStatus::Retrying);
    }
}
