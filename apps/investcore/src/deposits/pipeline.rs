use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::adapters::offramp::{OffRampAdapter, TransferRequest, TransferStatus};
use crate::audit::{AuditEntryDraft, AuditLog};
use crate::balances::BalancesStore;
use crate::error::CoreError;
use crate::job_store::JobStore;
use crate::wallets::ManagedWalletStore;

use super::store::{Deposit, DepositStatus, DepositStore};

/// Decimal places per `(chain, token)`, used to normalize provider-reported
/// raw amounts into the `Decimal` unit the ledger tracks (§4.G "token to
/// unit normalization").
#[derive(Debug, Clone, Copy)]
pub struct TokenDecimals {
    pub chain: &'static str,
    pub token: &'static str,
    pub decimals: u32,
}

pub const DEFAULT_TOKEN_DECIMALS: &[TokenDecimals] = &[
    TokenDecimals { chain: "SOL-DEVNET", token: "USDC", decimals: 6 },
    TokenDecimals { chain: "APTOS-TESTNET", token: "USDC", decimals: 6 },
    TokenDecimals { chain: "MATIC-AMOY", token: "USDC", decimals: 6 },
];

#[derive(Debug, Clone)]
pub enum DepositOutcome {
    Orphaned,
    AlreadyProcessed,
    Confirmed,
    Credited(Decimal),
}

/// Owns the `(chain, tx_hash)` upsert and the row-locked `Balances` credit
/// (§4.G), grounded on the idempotent "insert-or-skip, credit-or-replay"
/// shape used throughout the crate's settle paths.
pub struct DepositPipeline {
    deposits: Arc<dyn DepositStore>,
    wallets: Arc<dyn ManagedWalletStore>,
    balances: Arc<dyn BalancesStore>,
    audit: Arc<dyn AuditLog>,
    jobs: Arc<dyn JobStore>,
    offramp: Arc<dyn OffRampAdapter>,
    token_decimals: Vec<TokenDecimals>,
    notification_max_attempts: u32,
}

impl DepositPipeline {
    pub fn new(
        deposits: Arc<dyn DepositStore>,
        wallets: Arc<dyn ManagedWalletStore>,
        balances: Arc<dyn BalancesStore>,
        audit: Arc<dyn AuditLog>,
        jobs: Arc<dyn JobStore>,
        offramp: Arc<dyn OffRampAdapter>,
        notification_max_attempts: u32,
    ) -> Self {
        Self {
            deposits,
            wallets,
            balances,
            audit,
            jobs,
            offramp,
            token_decimals: DEFAULT_TOKEN_DECIMALS.to_vec(),
            notification_max_attempts,
        }
    }

    fn normalize(&self, chain: &str, token: &str, raw_amount: Decimal) -> Result<Decimal, CoreError> {
        let entry = self
            .token_decimals
            .iter()
            .find(|e| e.chain == chain && e.token == token)
            .ok_or_else(|| CoreError::UpstreamPermanent(format!("unknown token {token} on {chain}")))?;
        Ok(raw_amount.round_dp(entry.decimals))
    }

    /// Handles one chain-deposit webhook event (§4.G "Chain deposit").
    /// `confirmations`/`confirmation_threshold` come from the provider
    /// payload and per-chain config respectively.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_chain_deposit(
        &self,
        chain: &str,
        tx_hash: &str,
        destination_address: &str,
        token: &str,
        raw_amount: Decimal,
        confirmations: u32,
        confirmation_threshold: u32,
    ) -> Result<DepositOutcome, CoreError> {
        let owner = self.wallets.resolve_by_address(chain, destination_address).await?;
        let Some(user_id) = owner else {
            self.deposits
                .upsert_observed(chain, tx_hash, None, destination_address, token, raw_amount, confirmations, confirmation_threshold)
                .await?;
            warn!(chain, tx_hash, destination_address, "chain deposit to unrecognized address, recorded orphaned");
            return Ok(DepositOutcome::Orphaned);
        };

        let amount = self.normalize(chain, token, raw_amount)?;

        if let Some(existing) = self.deposits.get(chain, tx_hash).await? {
            if existing.status == DepositStatus::Credited {
                return Ok(DepositOutcome::AlreadyProcessed);
            }
        }

        let deposit = self
            .deposits
            .upsert_observed(chain, tx_hash, Some(user_id), destination_address, token, amount, confirmations, confirmation_threshold)
            .await?;

        if deposit.status != DepositStatus::Confirmed {
            return Ok(DepositOutcome::Confirmed);
        }

        self.credit_and_finalize(&deposit, user_id).await
    }

    async fn credit_and_finalize(&self, deposit: &Deposit, user_id: Uuid) -> Result<DepositOutcome, CoreError> {
        self.balances.credit(user_id, deposit.amount).await?;
        self.deposits.mark_credited(&deposit.chain, &deposit.tx_hash).await?;
        self.audit
            .record(AuditEntryDraft {
                actor: "webhook:chain_deposit".to_string(),
                action: "deposit.credited".to_string(),
                resource_type: "deposit".to_string(),
                resource_id: format!("{}:{}", deposit.chain, deposit.tx_hash),
                before: Some(json!({ "status": "confirmed" })),
                after: Some(json!({ "status": "credited" })),
                status: "ok".to_string(),
                amount: Some(deposit.amount),
                currency: Some(deposit.token.clone()),
                ip: None,
                ua: None,
                error: None,
            })
            .await?;
        self.jobs
            .enqueue(
                "send_notification",
                json!({ "user_id": user_id, "category": "deposit_credited", "amount": deposit.amount }),
                Some(&format!("notify-deposit-{}-{}", deposit.chain, deposit.tx_hash)),
                self.notification_max_attempts,
            )
            .await?;
        Ok(DepositOutcome::Credited(deposit.amount))
    }

    /// On `transfer.completed`: credit `buying_power` with the fiat
    /// proceeds, keyed by transfer id so redelivery is a no-op (§4.G
    /// "Virtual-account deposit").
    pub async fn handle_transfer_completed(&self, user_id: Uuid, transfer_id: &str) -> Result<DepositOutcome, CoreError> {
        let transfer = self.offramp.get_transfer(transfer_id).await?;
        if transfer.status != TransferStatus::Completed {
            return Err(CoreError::Validation(format!("transfer {transfer_id} is not completed")));
        }
        if let Some(existing) = self.deposits.get("OFFRAMP", transfer_id).await? {
            if existing.status == DepositStatus::Credited {
                return Ok(DepositOutcome::AlreadyProcessed);
            }
        }
        let deposit = self
            .deposits
            .upsert_observed("OFFRAMP", transfer_id, Some(user_id), "virtual-account", "USD", transfer.amount, 1, 1)
            .await?;
        self.credit_and_finalize(&deposit, user_id).await
    }

    /// On `transfer.failed`: record the failure and alert; never credits.
    pub async fn handle_transfer_failed(&self, user_id: Uuid, transfer_id: &str, reason: &str) -> Result<(), CoreError> {
        self.deposits.mark_rejected("OFFRAMP", transfer_id, reason).await.ok();
        self.audit
            .record(AuditEntryDraft {
                actor: "webhook:off_ramp".to_string(),
                action: "transfer.failed".to_string(),
                resource_type: "deposit".to_string(),
                resource_id: format!("OFFRAMP:{transfer_id}"),
                before: None,
                after: None,
                status: "failed".to_string(),
                amount: None,
                currency: None,
                ip: None,
                ua: None,
                error: Some(reason.to_string()),
            })
            .await?;
        self.jobs
            .enqueue(
                "send_notification",
                json!({ "user_id": user_id, "category": "transfer_failed", "reason": reason }),
                Some(&format!("notify-transfer-failed-{transfer_id}")),
                self.notification_max_attempts,
            )
            .await?;
        Ok(())
    }

    /// Initiates a fiat off-ramp transfer after a virtual-account deposit is
    /// observed; the resulting `transfer_id` is the idempotency key for the
    /// eventual `transfer.completed`/`transfer.failed` webhook.
    pub async fn initiate_transfer(&self, user_id: Uuid, source_account_id: &str, amount: Decimal) -> Result<String, CoreError> {
        let transfer = self
            .offramp
            .create_transfer(TransferRequest {
                source_account_id: source_account_id.to_string(),
                amount,
                currency: "USD".to_string(),
            })
            .await?;
        Ok(transfer.transfer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::offramp::MockOffRampAdapter;
    use crate::adapters::wallet::WalletAccountType;
    use crate::audit::MemoryAuditLog;
    use crate::balances::MemoryBalancesStore;
    use crate::job_store::MemoryJobStore;
    use crate::wallets::MemoryManagedWalletStore;
    use super::super::store::MemoryDepositStore;

    fn pipeline() -> (DepositPipeline, Arc<MemoryManagedWalletStore>, Arc<MemoryBalancesStore>) {
        let deposits = Arc::new(MemoryDepositStore::new());
        let wallets = Arc::new(MemoryManagedWalletStore::new());
        let balances = Arc::new(MemoryBalancesStore::new());
        let audit = Arc::new(MemoryAuditLog::new("secret"));
        let jobs = Arc::new(MemoryJobStore::new());
        let offramp = Arc::new(MockOffRampAdapter);
        (
            DepositPipeline::new(deposits, wallets.clone(), balances.clone(), audit, jobs, offramp, 5),
            wallets,
            balances,
        )
    }

    #[tokio::test]
    async fn confirmed_deposit_credits_buying_power_exactly_once_on_replay() {
        let (pipeline, wallets, balances) = pipeline();
        let user_id = Uuid::new_v4();
        wallets
            .upsert_live(user_id, "SOL-DEVNET", "pw-1", "addr-1", WalletAccountType::Eoa)
            .await
            .unwrap();

        let first = pipeline
            .handle_chain_deposit("SOL-DEVNET", "0xT1", "addr-1", "USDC", Decimal::new(10000, 2), 1, 1)
            .await
            .unwrap();
        assert!(matches!(first, DepositOutcome::Credited(_)));

        let second = pipeline
            .handle_chain_deposit("SOL-DEVNET", "0xT1", "addr-1", "USDC", Decimal::new(10000, 2), 1, 1)
            .await
            .unwrap();
        assert!(matches!(second, DepositOutcome::AlreadyProcessed));

        let balance = balances.get_or_create(user_id).await.unwrap();
        assert_eq!(balance.buying_power, Decimal::new(10000, 2));
    }

    #[tokio::test]
    async fn deposit_to_unknown_address_is_orphaned() {
        let (pipeline, _wallets, _balances) = pipeline();
        let outcome = pipeline
            .handle_chain_deposit("SOL-DEVNET", "0xT2", "addr-unknown", "USDC", Decimal::new(500, 2), 1, 1)
            .await
            .unwrap();
        assert!(matches!(outcome, DepositOutcome::Orphaned));
    }
}
