use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::wallet::{WalletAccountType, WalletProviderAdapter};
use crate::audit::{AuditEntryDraft, AuditLog};
use crate::error::CoreError;
use crate::job_store::{Job, JobStore};
use crate::onboarding::{OnboardingEvent, OnboardingMachine};
use crate::wallets::ManagedWalletStore;

const JOB_TYPE: &str = "wallet_provision";

#[derive(Debug, Deserialize)]
struct WalletProvisionPayload {
    user_id: Uuid,
    chains: Vec<String>,
}

/// Per-job progress, persisted in `Job::progress` after every chain
/// resolves so a crashed worker resumes without re-attempting completed
/// chains (§4.E "partial progress is durable after each chain success").
#[derive(Debug, Default, Serialize, Deserialize)]
struct WalletProvisionProgress {
    #[serde(default)]
    wallet_set: Option<String>,
    #[serde(default)]
    completed: Vec<String>,
    #[serde(default)]
    failed: HashMap<String, String>,
}

impl WalletProvisionProgress {
    fn from_job(job: &Job) -> Self {
        serde_json::from_value(job.progress.clone()).unwrap_or_default()
    }

    fn patch(&self) -> Value {
        json!({
            "wallet_set": self.wallet_set,
            "completed": self.completed,
            "failed": self.failed,
        })
    }
}

enum ChainOutcome {
    Completed(String),
    Pending(String, String),
    Failed(String, String),
}

pub struct WalletProvisioningWorker {
    worker_id: String,
    jobs: Arc<dyn JobStore>,
    wallets: Arc<dyn ManagedWalletStore>,
    provider: Arc<dyn WalletProviderAdapter>,
    audit: Arc<dyn AuditLog>,
    onboarding: Arc<OnboardingMachine>,
    poll_interval: Duration,
    worker_concurrency: usize,
    fanout_concurrency: usize,
    lease_ttl_seconds: i64,
    max_attempts: u32,
    backoff_base_seconds: u64,
    backoff_cap_seconds: u64,
    account_type: WalletAccountType,
}

impl WalletProvisioningWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        jobs: Arc<dyn JobStore>,
        wallets: Arc<dyn ManagedWalletStore>,
        provider: Arc<dyn WalletProviderAdapter>,
        audit: Arc<dyn AuditLog>,
        onboarding: Arc<OnboardingMachine>,
        poll_interval: Duration,
        worker_concurrency: usize,
        fanout_concurrency: usize,
        lease_ttl_seconds: i64,
        max_attempts: u32,
        backoff_base_seconds: u64,
        backoff_cap_seconds: u64,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            jobs,
            wallets,
            provider,
            audit,
            onboarding,
            poll_interval,
            worker_concurrency,
            fanout_concurrency,
            lease_ttl_seconds,
            max_attempts,
            backoff_base_seconds,
            backoff_cap_seconds,
            account_type: WalletAccountType::Eoa,
        }
    }

    /// Polls `JobStore::lease` on `poll_interval` until `shutdown` fires,
    /// then drains in-flight jobs back to the queue rather than letting
    /// their leases expire (§4.E graceful shutdown).
    pub async fn run(&self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.worker_concurrency));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("wallet provisioning worker shutting down");
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
                    error!(%error, "wallet provisioning lease failed");
                    continue;
                }
            };

            for job in leased {
                let semaphore = semaphore.clone();
                let worker = self.clone_handles();
                let shutdown = shutdown.clone();
                let Ok(permit) = semaphore.acquire_owned().await else {
                    let _ = worker.jobs.release(job.id).await;
                    continue;
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    if shutdown.is_cancelled() {
                        let _ = worker.jobs.release(job.id).await;
                        return;
                    }
                    worker.process(job).await;
                });
            }
        }
    }

    fn clone_handles(&self) -> Self {
        Self {
            worker_id: self.worker_id.clone(),
            jobs: self.jobs.clone(),
            wallets: self.wallets.clone(),
            provider: self.provider.clone(),
            audit: self.audit.clone(),
            onboarding: self.onboarding.clone(),
            poll_interval: self.poll_interval,
            worker_concurrency: self.worker_concurrency,
            fanout_concurrency: self.fanout_concurrency,
            lease_ttl_seconds: self.lease_ttl_seconds,
            max_attempts: self.max_attempts,
            backoff_base_seconds: self.backoff_base_seconds,
            backoff_cap_seconds: self.backoff_cap_seconds,
            account_type: self.account_type,
        }
    }

    async fn process(&self, job: Job) {
        if let Err(error) = self.attempt(&job).await {
            warn!(job_id = %job.id, %error, "wallet provisioning attempt raised unexpectedly");
            let _ = self
                .jobs
                .fail(
                    job.id,
                    &error.message(),
                    error.is_retryable(),
                    self.backoff_base_seconds,
                    self.backoff_cap_seconds,
                )
                .await;
        }
    }

    async fn attempt(&self, job: &Job) -> Result<(), CoreError> {
        let payload: WalletProvisionPayload = serde_json::from_value(job.payload.clone())
            .map_err(|error| CoreError::Internal(format!("bad wallet_provision payload: {error}")))?;
        let mut progress = WalletProvisionProgress::from_job(job);

        let wallet_set = match progress.wallet_set.clone() {
            Some(wallet_set) => wallet_set,
            None => {
                let wallet_set = self
                    .provider
                    .create_wallet_set(&payload.user_id.to_string())
                    .await
                    .map_err(CoreError::from)?;
                progress.wallet_set = Some(wallet_set.clone());
                wallet_set
            }
        };

        let remaining: Vec<String> = payload
            .chains
            .iter()
            .filter(|c| !progress.completed.contains(c) && !progress.failed.contains_key(c.as_str()))
            .cloned()
            .collect();

        let outcomes: Vec<ChainOutcome> = stream::iter(remaining.into_iter().map(|chain| {
            let provider = self.provider.clone();
            let wallets = self.wallets.clone();
            let audit = self.audit.clone();
            let wallet_set = wallet_set.clone();
            let user_id = payload.user_id;
            let account_type = self.account_type;
            async move {
                match provider.create_wallet(&wallet_set, &chain, account_type).await {
                    Ok(provider_wallet) => {
                        if let Err(error) = wallets
                            .upsert_live(
                                user_id,
                                &chain,
                                &provider_wallet.provider_id,
                                &provider_wallet.address,
                                account_type,
                            )
                            .await
                        {
                            return ChainOutcome::Pending(chain, error.message());
                        }
                        let _ = audit
                            .record(AuditEntryDraft {
                                actor: "worker:wallet_provision".to_string(),
                                action: "wallet.provisioned".to_string(),
                                resource_type: "managed_wallet".to_string(),
                                resource_id: format!("{user_id}:{chain}"),
                                before: None,
                                after: Some(json!({ "chain": chain, "status": "live" })),
                                status: "ok".to_string(),
                                amount: None,
                                currency: None,
                                ip: None,
                                ua: None,
                                error: None,
                            })
                            .await;
                        ChainOutcome::Completed(chain)
                    }
                    Err(adapter_error) => {
                        if adapter_error.is_retryable() {
                            ChainOutcome::Pending(chain, adapter_error.to_string())
                        } else {
                            ChainOutcome::Failed(chain, adapter_error.to_string())
                        }
                    }
                }
            }
        }))
        .buffer_unordered(self.fanout_concurrency)
        .collect()
        .await;

        for outcome in outcomes {
            match outcome {
                ChainOutcome::Completed(chain) => progress.completed.push(chain),
                ChainOutcome::Failed(chain, reason) => {
                    progress.failed.insert(chain, reason);
                }
                ChainOutcome::Pending(_, _) => {}
            }
        }

        self.jobs.save_progress(job.id, progress.patch()).await?;

        let requested: std::collections::HashSet<&String> = payload.chains.iter().collect();
        let completed: std::collections::HashSet<&String> = progress.completed.iter().collect();
        let failed: std::collections::HashSet<&String> = progress.failed.keys().collect();

        if completed == requested {
            self.jobs.complete(job.id, progress.patch()).await?;
            self.onboarding
                .transition(
                    payload.user_id,
                    OnboardingEvent::WalletsProvisioned,
                    "worker:wallet_provision",
                )
                .await?;
            return Ok(());
        }

        let union: std::collections::HashSet<&String> = completed.union(&failed).cloned().collect();
        if union == requested && !failed.is_empty() {
            self.jobs
                .fail(
                    job.id,
                    &format!("chains failed: {:?}", progress.failed),
                    false,
                    self.backoff_base_seconds,
                    self.backoff_cap_seconds,
                )
                .await?;
            return Ok(());
        }

        self.jobs
            .fail(
                job.id,
                "some chains still pending",
                true,
                self.backoff_base_seconds,
                self.backoff_cap_seconds,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::job_store::MemoryJobStore;
    use crate::security::MemoryPasscodeStore;
    use crate::users::{MemoryUserStore, NewUser, OnboardingStatus, UserStore};
    use crate::wallets::MemoryManagedWalletStore;

    async fn setup_user_in_wallets_provisioning() -> (Uuid, Arc<MemoryUserStore>) {
        let users = Arc::new(MemoryUserStore::new());
        let user = users
            .create(NewUser {
                email: Some("a@x.com".into()),
                phone: None,
                password_hash: "hash".into(),
            })
            .await
            .unwrap();
        users
            .update(
                user.id,
                Box::new(|u| {
                    u.onboarding_status = OnboardingStatus::WalletsProvisioning;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        (user.id, users)
    }

    #[tokio::test]
    async fn succeeding_chains_complete_the_job_and_onboarding() {
        let (user_id, users) = setup_user_in_wallets_provisioning().await;
        let jobs = Arc::new(MemoryJobStore::new());
        let wallets = Arc::new(MemoryManagedWalletStore::new());
        let audit = Arc::new(MemoryAuditLog::new("secret"));
        let passcodes = Arc::new(MemoryPasscodeStore::new(5, 15 * 60, 10 * 60));
        let onboarding = Arc::new(OnboardingMachine::new(
            users.clone(),
            jobs.clone(),
            audit.clone(),
            passcodes,
            5,
            5,
        ));
        let provider = Arc::new(crate::adapters::wallet::MockWalletProviderAdapter::new(
            vec!["SOL-DEVNET".to_string(), "APTOS-TESTNET".to_string()],
            vec![],
        ));

        let job = jobs
            .enqueue(
                "wallet_provision",
                json!({ "user_id": user_id, "chains": ["SOL-DEVNET", "APTOS-TESTNET"] }),
                None,
                5,
            )
            .await
            .unwrap();

        let worker = WalletProvisioningWorker::new(
            "test-worker",
            jobs.clone(),
            wallets.clone(),
            provider,
            audit,
            onboarding,
            Duration::from_millis(10),
            4,
            4,
            60,
            5,
            30,
            1_800,
        );

        worker.attempt(&job).await.unwrap();

        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::job_store::JobStatus::Succeeded);
        assert_eq!(wallets.list_for_user(user_id).await.unwrap().len(), 2);

        let user = users.get(user_id).await.unwrap().unwrap();
        assert_eq!(user.onboarding_status, OnboardingStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failure_schedules_a_retry_without_losing_progress() {
        let (user_id, users) = setup_user_in_wallets_provisioning().await;
        let jobs = Arc::new(MemoryJobStore::new());
        let wallets = Arc::new(MemoryManagedWalletStore::new());
        let audit = Arc::new(MemoryAuditLog::new("secret"));
        let passcodes = Arc::new(MemoryPasscodeStore::new(5, 15 * 60, 10 * 60));
        let onboarding = Arc::new(OnboardingMachine::new(
            users.clone(),
            jobs.clone(),
            audit.clone(),
            passcodes,
            5,
            5,
        ));
        let provider = Arc::new(crate::adapters::wallet::MockWalletProviderAdapter::new(
            vec!["SOL-DEVNET".to_string(), "MATIC-AMOY".to_string()],
            vec!["MATIC-AMOY".to_string()],
        ));

        let job = jobs
            .enqueue(
                "wallet_provision",
                json!({ "user_id": user_id, "chains": ["SOL-DEVNET", "MATIC-AMOY"] }),
                None,
                5,
            )
            .await
            .unwrap();

        let worker = WalletProvisioningWorker::new(
            "test-worker",
            jobs.clone(),
            wallets.clone(),
            provider,
            audit,
            onboarding,
            Duration::from_millis(10),
            4,
            4,
            60,
            5,
            30,
            1_800,
        );

        worker.attempt(&job).await.unwrap();
        let after_first = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(after_first.status, crate::job_store::JobStatus::Retrying);
        assert_eq!(wallets.list_for_user(user_id).await.unwrap().len(), 1);

        worker.attempt(&after_first).await.unwrap();
        let after_second = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(after_second.status, crate::job_store::JobStatus::Succeeded);
        assert_eq!(wallets.list_for_user(user_id).await.unwrap().len(), 2);
    }
}
