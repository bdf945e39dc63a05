use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::job_store::{Job, JobStore};
use crate::users::UserStore;

use super::channel::{Channel, NotificationPayload};

const JOB_TYPE: &str = "send_notification";

#[derive(Debug, Deserialize)]
struct NotificationJobPayload {
    user_id: Uuid,
    category: String,
    #[serde(default)]
    identifier: Option<String>,
    #[serde(flatten)]
    extra: Value,
}

/// Per-user sliding window used for the 10/hour + 1s-min-gap rate limit
/// (§4.I). Timestamps older than an hour are dropped lazily on each check.
struct UserWindow {
    sent_in_last_hour: VecDeque<DateTime<Utc>>,
    last_sent_at: Option<DateTime<Utc>>,
}

struct RateLimiter {
    windows: Mutex<HashMap<Uuid, UserWindow>>,
    rate_per_hour: u32,
    min_gap: chrono::Duration,
}

impl RateLimiter {
    fn new(rate_per_hour: u32, min_gap_seconds: i64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            rate_per_hour,
            min_gap: chrono::Duration::seconds(min_gap_seconds),
        }
    }

    /// Returns `true` if a send for `user_id` is allowed right now, and
    /// records it if so (check-and-record is one atomic step under the
    /// lock, mirroring the row-locked reserve/consume pattern elsewhere).
    async fn try_acquire(&self, user_id: Uuid) -> bool {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(user_id).or_insert_with(|| UserWindow {
            sent_in_last_hour: VecDeque::new(),
            last_sent_at: None,
        });

        while let Some(front) = window.sent_in_last_hour.front() {
            if now - *front > chrono::Duration::hours(1) {
                window.sent_in_last_hour.pop_front();
            } else {
                break;
            }
        }

        if let Some(last) = window.last_sent_at {
            if now - last < self.min_gap {
                return false;
            }
        }
        if window.sent_in_last_hour.len() as u32 >= self.rate_per_hour {
            return false;
        }

        window.sent_in_last_hour.push_back(now);
        window.last_sent_at = Some(now);
        true
    }
}

/// 60s dedupe cache keyed by `(user_id, category, identifier)` (§4.I),
/// distinct from the Job Store's own `dedupe_key`: this catches duplicate
/// *notifications* reached via different enqueue paths, not duplicate jobs.
struct DedupeCache {
    last_sent: Mutex<HashMap<(Uuid, String, String), DateTime<Utc>>>,
    window: chrono::Duration,
}

impl DedupeCache {
    fn new(window_seconds: i64) -> Self {
        Self {
            last_sent: Mutex::new(HashMap::new()),
            window: chrono::Duration::seconds(window_seconds),
        }
    }

    async fn should_send(&self, user_id: Uuid, category: &str, identifier: &str) -> bool {
        let now = Utc::now();
        let key = (user_id, category.to_string(), identifier.to_string());
        let mut last_sent = self.last_sent.lock().await;
        if let Some(previous) = last_sent.get(&key) {
            if now - *previous < self.window {
                return false;
            }
        }
        last_sent.insert(key, now);
        true
    }
}

/// Job handler for `send_notification` (§4.I). Resolves the recipient,
/// picks a channel by category, and enforces the rate limit and dedupe
/// cache before dispatch.
pub struct NotificationFanout {
    worker_id: String,
    jobs: Arc<dyn JobStore>,
    users: Arc<dyn UserStore>,
    email: Arc<dyn Channel>,
    sms: Arc<dyn Channel>,
    rate_limiter: RateLimiter,
    dedupe: DedupeCache,
    poll_interval: Duration,
    lease_ttl_seconds: i64,
    backoff_base_seconds: u64,
    backoff_cap_seconds: u64,
}

impl NotificationFanout {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        jobs: Arc<dyn JobStore>,
        users: Arc<dyn UserStore>,
        email: Arc<dyn Channel>,
        sms: Arc<dyn Channel>,
        rate_per_hour: u32,
        min_gap_seconds: i64,
        dedupe_window_seconds: i64,
        poll_interval: Duration,
        lease_ttl_seconds: i64,
        backoff_base_seconds: u64,
        backoff_cap_seconds: u64,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            jobs,
            users,
            email,
            sms,
            rate_limiter: RateLimiter::new(rate_per_hour, min_gap_seconds),
            dedupe: DedupeCache::new(dedupe_window_seconds),
            poll_interval,
            lease_ttl_seconds,
            backoff_base_seconds,
            backoff_cap_seconds,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("notification fanout shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let leased = match self
                .jobs
                .lease(&self.worker_id, 16, chrono::Duration::seconds(self.lease_ttl_seconds))
                .await
            {
                Ok(jobs) => jobs.into_iter().filter(|j| j.job_type == JOB_TYPE).collect::<Vec<_>>(),
                Err(error) => {
                    error!(%error, "notification lease failed");
                    continue;
                }
            };

            for job in leased {
                if shutdown.is_cancelled() {
                    let _ = self.jobs.release(job.id).await;
                    continue;
                }
                self.process(job).await;
            }
        }
    }

    async fn process(&self, job: Job) {
        if let Err(error) = self.attempt(&job).await {
            warn!(job_id = %job.id, %error, "notification attempt raised unexpectedly");
            let _ = self
                .jobs
                .fail(job.id, &error.message(), error.is_retryable(), self.backoff_base_seconds, self.backoff_cap_seconds)
                .await;
        }
    }

    async fn attempt(&self, job: &Job) -> Result<(), CoreError> {
        let payload: NotificationJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|error| CoreError::Internal(format!("bad send_notification payload: {error}")))?;

        let user = self
            .users
            .get(payload.user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("user {}", payload.user_id)))?;

        let identifier = payload.identifier.clone().unwrap_or_else(|| job.id.to_string());
        if !self.dedupe.should_send(payload.user_id, &payload.category, &identifier).await {
            info!(job_id = %job.id, user_id = %payload.user_id, "notification deduplicated, skipping send");
            self.jobs.complete(job.id, serde_json::json!({ "deduplicated": true })).await?;
            return Ok(());
        }
        if !self.rate_limiter.try_acquire(payload.user_id).await {
            self.jobs
                .fail(job.id, "notification rate limit exceeded", true, self.backoff_base_seconds, self.backoff_cap_seconds)
                .await?;
            return Ok(());
        }

        let (channel, recipient): (&Arc<dyn Channel>, String) = if let Some(email) = user.email.clone() {
            (&self.email, email)
        } else if let Some(phone) = user.phone.clone() {
            (&self.sms, phone)
        } else {
            return Err(CoreError::Internal(format!("user {} has no contact channel", user.id)));
        };

        let notification = NotificationPayload {
            recipient,
            subject: payload.category.clone(),
            body: render_body(&payload.category, &payload.extra),
        };

        match channel.send(&notification).await {
            Ok(()) => {
                self.jobs.complete(job.id, serde_json::json!({ "sent": true })).await?;
                Ok(())
            }
            Err(adapter_error) => {
                let core_error: CoreError = adapter_error.into();
                self.jobs
                    .fail(job.id, &core_error.message(), core_error.is_retryable(), self.backoff_base_seconds, self.backoff_cap_seconds)
                    .await?;
                Ok(())
            }
        }
    }
}

/// Template rendering is out of scope (§1 Non-goals); this only produces a
/// stable plain-text line the channel can ship as-is.
fn render_body(category: &str, extra: &Value) -> String {
    format!("{category}: {extra}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::MemoryJobStore;
    use crate::notifications::channel::MockChannel;
    use crate::users::{MemoryUserStore, NewUser};

    async fn setup() -> (NotificationFanout, Arc<MemoryJobStore>, Arc<MockChannel>, Uuid) {
        let jobs = Arc::new(MemoryJobStore::new());
        let users = Arc::new(MemoryUserStore::new());
        let email = Arc::new(MockChannel::new());
        let sms = Arc::new(MockChannel::new());

        let user = users
            .create(NewUser { email: Some("a@x.com".into()), phone: None, password_hash: "hash".into() })
            .await
            .unwrap();

        let fanout = NotificationFanout::new(
            "test-worker",
            jobs.clone(),
            users,
            email.clone(),
            sms,
            10,
            1,
            60,
            Duration::from_millis(10),
            60,
            30,
            1_800,
        );
        (fanout, jobs, email, user.id)
    }

    #[tokio::test]
    async fn sends_through_email_when_present_and_completes_the_job() {
        let (fanout, jobs, email, user_id) = setup().await;
        let job = jobs
            .enqueue("send_notification", serde_json::json!({ "user_id": user_id, "category": "onboarding_complete" }), None, 5)
            .await
            .unwrap();

        fanout.attempt(&job).await.unwrap();

        assert_eq!(email.sent.lock().await.len(), 1);
        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::job_store::JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn duplicate_notification_within_window_is_skipped() {
        let (fanout, jobs, email, user_id) = setup().await;
        let payload = serde_json::json!({ "user_id": user_id, "category": "deposit_credited", "identifier": "dep-1" });

        let first = jobs.enqueue("send_notification", payload.clone(), None, 5).await.unwrap();
        fanout.attempt(&first).await.unwrap();

        let second = jobs.enqueue("send_notification", payload, Some("dep-1-b"), 5).await.unwrap();
        fanout.attempt(&second).await.unwrap();

        assert_eq!(email.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_blocks_the_eleventh_send_in_an_hour() {
        let (fanout, jobs, email, user_id) = setup().await;
        for i in 0..10 {
            let job = jobs
                .enqueue(
                    "send_notification",
                    serde_json::json!({ "user_id": user_id, "category": "order_settled", "identifier": format!("o-{i}") }),
                    None,
                    5,
                )
                .await
                .unwrap();
            fanout.attempt(&job).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(email.sent.lock().await.len(), 10);

        let eleventh = jobs
            .enqueue(
                "send_notification",
                serde_json::json!({ "user_id": user_id, "category": "order_settled", "identifier": "o-10" }),
                None,
                5,
            )
            .await
            .unwrap();
        fanout.attempt(&eleventh).await.unwrap();
        assert_eq!(email.sent.lock().await.len(), 10);
        let stored = jobs.get(eleventh.id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::job_store::JobStatus::Retrying);
    }
}
