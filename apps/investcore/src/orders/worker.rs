use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::job_store::{Job, JobStore};

use super::engine::OrderEngine;

const JOB_TYPE: &str = "order_submit_retry";

/// Polls `order_submit_retry` jobs enqueued by `OrderEngine::dispatch_to_brokerage`
/// on a transient adapter failure and re-attempts submission, following the
/// same lease/backoff shape as `wallet_provisioning::WalletProvisioningWorker`.
pub struct OrderSubmissionWorker {
    worker_id: String,
    jobs: Arc<dyn JobStore>,
    engine: Arc<OrderEngine>,
    poll_interval: Duration,
    worker_concurrency: usize,
    lease_ttl_seconds: i64,
    backoff_base_seconds: u64,
    backoff_cap_seconds: u64,
}

impl OrderSubmissionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        jobs: Arc<dyn JobStore>,
        engine: Arc<OrderEngine>,
        poll_interval: Duration,
        worker_concurrency: usize,
        lease_ttl_seconds: i64,
        backoff_base_seconds: u64,
        backoff_cap_seconds: u64,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            jobs,
            engine,
            poll_interval,
            worker_concurrency,
            lease_ttl_seconds,
            backoff_base_seconds,
            backoff_cap_seconds,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.worker_concurrency));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("order submission worker shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let available = semaphore.available_permits();
            if available == 0 {
                continue;
            }

            let leased = match self
                .jobs
                .lease(&self.worker_id, available, chrono::Duration::seconds(self.lease_ttl_seconds))
                .await
            {
                Ok(jobs) => jobs.into_iter().filter(|j| j.job_type == JOB_TYPE).collect::<Vec<_>>(),
                Err(error) => {
                    error!(%error, "order submission lease failed");
                    continue;
                }
            };

            for job in leased {
                let semaphore = semaphore.clone();
                let jobs = self.jobs.clone();
                let engine = self.engine.clone();
                let backoff_base_seconds = self.backoff_base_seconds;
                let backoff_cap_seconds = self.backoff_cap_seconds;
                let shutdown = shutdown.clone();
                let Ok(permit) = semaphore.acquire_owned().await else {
                    let _ = jobs.release(job.id).await;
                    continue;
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    if shutdown.is_cancelled() {
                        let _ = jobs.release(job.id).await;
                        return;
                    }
                    process(&jobs, &engine, &job, backoff_base_seconds, backoff_cap_seconds).await;
                });
            }
        }
    }
}

async fn process(
    jobs: &Arc<dyn JobStore>,
    engine: &Arc<OrderEngine>,
    job: &Job,
    backoff_base_seconds: u64,
    backoff_cap_seconds: u64,
) {
    if let Err(error) = attempt(jobs, engine, job).await {
        warn!(job_id = %job.id, %error, "order submission attempt raised unexpectedly");
        let _ = jobs
            .fail(job.id, &error.message(), error.is_retryable(), backoff_base_seconds, backoff_cap_seconds)
            .await;
    }
}

async fn attempt(jobs: &Arc<dyn JobStore>, engine: &Arc<OrderEngine>, job: &Job) -> Result<(), CoreError> {
    let order_id: Uuid = job
        .payload
        .get("order_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CoreError::Internal("order_submit_retry payload missing order_id".to_string()))?;

    match engine.retry_submission(order_id).await {
        Ok(_) => {
            jobs.complete(job.id, serde_json::json!({})).await?;
            Ok(())
        }
        Err(error) if error.is_retryable() => {
            jobs.fail(job.id, &error.message(), true, 30, 1_800).await?;
            Ok(())
        }
        Err(error) => {
            jobs.fail(job.id, &error.message(), false, 30, 1_800).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    use crate::adapters::brokerage::{MockBrokerageAdapter, OrderSide};
    use crate::audit::MemoryAuditLog;
    use crate::balances::{BalancesStore, MemoryBalancesStore};
    use crate::idempotency::{IdempotencyBackend, MemoryIdempotencyLedger};
    use crate::job_store::MemoryJobStore;
    use crate::orders::basket::{BasketConstituent, BasketStore, MemoryBasketStore, RiskLevel};
    use crate::orders::store::{MemoryOrderStore, MemoryPositionStore, OrderStatus, OrderStore};

    /// Orders left `Pending` by `OrderStore::create` never auto-dispatch;
    /// only `OrderEngine::create_order` does that. That's exactly the state
    /// a crash between insert and dispatch, or a transient-failure retry
    /// job, would find the order in.
    #[tokio::test]
    async fn retry_job_resubmits_a_pending_order() {
        let orders = Arc::new(MemoryOrderStore::new());
        let positions = Arc::new(MemoryPositionStore::new());
        let baskets = Arc::new(MemoryBasketStore::new());
        let balances = Arc::new(MemoryBalancesStore::new());
        let brokerage = Arc::new(MockBrokerageAdapter);
        let idempotency = Arc::new(IdempotencyBackend::Memory(MemoryIdempotencyLedger::new()));
        let audit = Arc::new(MemoryAuditLog::new("secret"));
        let jobs = Arc::new(MemoryJobStore::new());

        let user_id = Uuid::new_v4();
        balances.credit(user_id, Decimal::new(100000, 2)).await.unwrap();
        let basket = baskets
            .create(
                "growth-mix",
                RiskLevel::Growth,
                vec![BasketConstituent { symbol: "VOO".to_string(), weight: Decimal::ONE }],
            )
            .await
            .unwrap();

        let engine = Arc::new(OrderEngine::new(
            orders.clone(),
            positions,
            baskets,
            balances,
            brokerage,
            idempotency,
            audit,
            jobs.clone(),
            5,
            5,
        ));

        let order = orders
            .create(user_id, basket.id, OrderSide::Buy, Decimal::new(10000, 2))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        let job = jobs
            .enqueue(
                "order_submit_retry",
                serde_json::json!({ "order_id": order.id }),
                Some(&format!("order-submit-{}", order.id)),
                5,
            )
            .await
            .unwrap();

        attempt(&jobs, &engine, &job).await.unwrap();

        let updated = orders.get(order.id).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Accepted);
        let stored_job = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored_job.status, crate::job_store::JobStatus::Succeeded);
    }
}
