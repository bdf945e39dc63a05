use std::sync::Arc;

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use crate::adapters::kyc::{KycAdapter, KycStatusReport};
use crate::deposits::DepositPipeline;
use crate::error::CoreError;
use crate::idempotency::IdempotencyBackend;
use crate::onboarding::{OnboardingEvent, OnboardingMachine};
use crate::orders::engine::{FillOutcome, OrderEngine};
use crate::retry::retry_with_backoff;
use crate::users::UserStore;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookSource {
    ChainDeposit,
    Brokerage,
    OffRamp,
    Kyc,
}

impl WebhookSource {
    fn label(self) -> &'static str {
        match self {
            Self::ChainDeposit => "webhook:chain_deposit",
            Self::Brokerage => "webhook:brokerage_fill",
            Self::OffRamp => "webhook:off_ramp",
            Self::Kyc => "webhook:kyc",
        }
    }
}

/// Verifies `signature_hex` against the HMAC-SHA256 of `body` under
/// `secret`, mirroring `audit::verify`'s sign/verify shape. Returns
/// `Forbidden` rather than a bool so callers propagate with `?`.
fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> Result<(), CoreError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|error| CoreError::Internal(format!("failed to init webhook hmac: {error}")))?;
    mac.update(body);
    let expected = hex::decode(signature_hex)
        .map_err(|_| CoreError::Forbidden("malformed webhook signature".to_string()))?;
    mac.verify_slice(&expected)
        .map_err(|_| CoreError::Forbidden("invalid webhook signature".to_string()))
}

#[derive(Debug, Deserialize)]
struct ChainDepositEvent {
    chain: String,
    tx_hash: String,
    destination_address: String,
    token: String,
    raw_amount: Decimal,
    confirmations: u32,
    confirmation_threshold: u32,
}

#[derive(Debug, Deserialize)]
struct BrokerageFillEvent {
    brokerage_ref: String,
    fill_id: String,
    cumulative_filled_quantity: Decimal,
    fill_price: Decimal,
    outcome: BrokerageFillOutcomeWire,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum BrokerageFillOutcomeWire {
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl From<BrokerageFillOutcomeWire> for FillOutcome {
    fn from(wire: BrokerageFillOutcomeWire) -> Self {
        match wire {
            BrokerageFillOutcomeWire::Partial => Self::Partial,
            BrokerageFillOutcomeWire::Filled => Self::Filled,
            BrokerageFillOutcomeWire::Cancelled => Self::Cancelled,
            BrokerageFillOutcomeWire::Rejected => Self::Rejected,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum OffRampEvent {
    TransferCompleted { user_id: Uuid, transfer_id: String },
    TransferFailed { user_id: Uuid, transfer_id: String, reason: String },
}

/// Entry point for every external webhook (§4.F). Verifies the per-source
/// HMAC signature, gates redelivery through `IdempotencyBackend` at the
/// intake layer (on top of whatever business-level idempotency the target
/// pipeline already does), then dispatches. A transient failure in the
/// target pipeline gets a few bounded in-process retries before the caller
/// sees an error, so a flaky internal dependency doesn't force the webhook
/// provider into its own redelivery backoff.
pub struct WebhookIntake {
    deposits: Arc<DepositPipeline>,
    orders: Arc<OrderEngine>,
    onboarding: Arc<OnboardingMachine>,
    users: Arc<dyn UserStore>,
    kyc: Arc<dyn KycAdapter>,
    idempotency: Arc<IdempotencyBackend>,
    hmac_secret_chain: String,
    hmac_secret_brokerage: String,
    hmac_secret_offramp: String,
    hmac_secret_kyc: String,
}

impl WebhookIntake {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deposits: Arc<DepositPipeline>,
        orders: Arc<OrderEngine>,
        onboarding: Arc<OnboardingMachine>,
        users: Arc<dyn UserStore>,
        kyc: Arc<dyn KycAdapter>,
        idempotency: Arc<IdempotencyBackend>,
        hmac_secret_chain: impl Into<String>,
        hmac_secret_brokerage: impl Into<String>,
        hmac_secret_offramp: impl Into<String>,
        hmac_secret_kyc: impl Into<String>,
    ) -> Self {
        Self {
            deposits,
            orders,
            onboarding,
            users,
            kyc,
            idempotency,
            hmac_secret_chain: hmac_secret_chain.into(),
            hmac_secret_brokerage: hmac_secret_brokerage.into(),
            hmac_secret_offramp: hmac_secret_offramp.into(),
            hmac_secret_kyc: hmac_secret_kyc.into(),
        }
    }

    pub async fn handle_chain_deposit(&self, body: &[u8], signature: &str) -> Result<Value, CoreError> {
        verify_signature(&self.hmac_secret_chain, body, signature)?;
        let event: ChainDepositEvent = serde_json::from_slice(body)
            .map_err(|error| CoreError::Validation(format!("malformed chain deposit event: {error}")))?;
        let event_id = format!("{}:{}", event.chain, event.tx_hash);

        retry_with_backoff(3, || async {
            let deposits = self.deposits.clone();
            let event = &event;
            self.idempotency
                .record_or_replay(WebhookSource::ChainDeposit.label(), &event_id, || async move {
                    let outcome = deposits
                        .handle_chain_deposit(
                            &event.chain,
                            &event.tx_hash,
                            &event.destination_address,
                            &event.token,
                            event.raw_amount,
                            event.confirmations,
                            event.confirmation_threshold,
                        )
                        .await?;
                    Ok(json!({ "outcome": format!("{outcome:?}") }))
                })
                .await
        })
        .await
    }

    pub async fn handle_brokerage_fill(&self, body: &[u8], signature: &str) -> Result<Value, CoreError> {
        verify_signature(&self.hmac_secret_brokerage, body, signature)?;
        let event: BrokerageFillEvent = serde_json::from_slice(body)
            .map_err(|error| CoreError::Validation(format!("malformed brokerage fill event: {error}")))?;
        let event_id = format!("{}:{}", event.brokerage_ref, event.fill_id);

        retry_with_backoff(3, || async {
            let orders = self.orders.clone();
            let event = &event;
            self.idempotency
                .record_or_replay(WebhookSource::Brokerage.label(), &event_id, || async move {
                    let order = orders
                        .reconcile_fill(
                            &event.brokerage_ref,
                            &event.fill_id,
                            event.cumulative_filled_quantity,
                            event.fill_price,
                            event.outcome.into(),
                        )
                        .await?;
                    Ok(json!({ "order_id": order.id, "status": order.status.as_str_label() }))
                })
                .await
        })
        .await
    }

    pub async fn handle_off_ramp(&self, body: &[u8], signature: &str) -> Result<Value, CoreError> {
        verify_signature(&self.hmac_secret_offramp, body, signature)?;
        let event: OffRampEvent = serde_json::from_slice(body)
            .map_err(|error| CoreError::Validation(format!("malformed off-ramp event: {error}")))?;

        match event {
            OffRampEvent::TransferCompleted { user_id, transfer_id } => {
                let event_id = format!("completed:{transfer_id}");
                retry_with_backoff(3, || async {
                    let deposits = self.deposits.clone();
                    let transfer_id = transfer_id.clone();
                    self.idempotency
                        .record_or_replay(WebhookSource::OffRamp.label(), &event_id, || async move {
                            let outcome = deposits.handle_transfer_completed(user_id, &transfer_id).await?;
                            Ok(json!({ "outcome": format!("{outcome:?}") }))
                        })
                        .await
                })
                .await
            }
            OffRampEvent::TransferFailed { user_id, transfer_id, reason } => {
                let event_id = format!("failed:{transfer_id}");
                retry_with_backoff(3, || async {
                    let deposits = self.deposits.clone();
                    let transfer_id = transfer_id.clone();
                    let reason = reason.clone();
                    self.idempotency
                        .record_or_replay(WebhookSource::OffRamp.label(), &event_id, || async move {
                            deposits.handle_transfer_failed(user_id, &transfer_id, &reason).await?;
                            Ok(json!({ "acknowledged": true }))
                        })
                        .await
                })
                .await
            }
        }
    }

    /// KYC callbacks carry only `provider_ref` (§4.C); the user is resolved
    /// via the reverse lookup populated when KYC submission stored it.
    /// A terminal status drives the onboarding machine; `Processing`/`Pending`
    /// just update the user's tracked `kyc_status` and stop.
    pub async fn handle_kyc_callback(&self, body: &[u8], signature: &str) -> Result<Value, CoreError> {
        verify_signature(&self.hmac_secret_kyc, body, signature)?;
        let payload: Value = serde_json::from_slice(body)
            .map_err(|error| CoreError::Validation(format!("malformed kyc callback: {error}")))?;
        let callback = self.kyc.accept_callback(&payload).await?;
        let event_id = format!("{}:{:?}", callback.provider_ref, callback.status);

        retry_with_backoff(3, || async {
            let callback = &callback;
            self.idempotency
                .record_or_replay(WebhookSource::Kyc.label(), &event_id, || async move {
                    let user = self
                        .users
                        .find_by_kyc_provider_ref(&callback.provider_ref)
                        .await?
                        .ok_or_else(|| {
                            CoreError::NotFound(format!("user for kyc provider_ref {}", callback.provider_ref))
                        })?;

                    match callback.status {
                        KycStatusReport::Approved => {
                            self.onboarding
                                .transition(user.id, OnboardingEvent::KycApproved, WebhookSource::Kyc.label())
                                .await?;
                        }
                        KycStatusReport::Rejected => {
                            self.onboarding
                                .transition(user.id, OnboardingEvent::KycRejected, WebhookSource::Kyc.label())
                                .await?;
                        }
                        KycStatusReport::Pending | KycStatusReport::Processing => {
                            self.users
                                .update(
                                    user.id,
                                    Box::new(move |u| {
                                        u.kyc_status = map_kyc_status(callback.status);
                                        Ok(())
                                    }),
                                )
                                .await?;
                        }
                    }

                    Ok(json!({ "user_id": user.id, "status": format!("{:?}", callback.status) }))
                })
                .await
        })
        .await
    }
}

fn map_kyc_status(status: KycStatusReport) -> crate::users::KycStatus {
    match status {
        KycStatusReport::Pending => crate::users::KycStatus::Pending,
        KycStatusReport::Processing => crate::users::KycStatus::Processing,
        KycStatusReport::Approved => crate::users::KycStatus::Approved,
        KycStatusReport::Rejected => crate::users::KycStatus::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::Mac;
    use rust_decimal::Decimal as D;

    use crate::adapters::brokerage::MockBrokerageAdapter;
    use crate::adapters::kyc::MockKycAdapter;
    use crate::adapters::offramp::MockOffRampAdapter;
    use crate::audit::MemoryAuditLog;
    use crate::balances::MemoryBalancesStore;
    use crate::deposits::MemoryDepositStore;
    use crate::idempotency::MemoryIdempotencyLedger;
    use crate::job_store::MemoryJobStore;
    use crate::orders::basket::MemoryBasketStore;
    use crate::orders::store::{MemoryOrderStore, MemoryPositionStore};
    use crate::security::{MemoryPasscodeStore, PasscodeStore};
    use crate::users::{MemoryUserStore, NewUser};
    use crate::wallets::MemoryManagedWalletStore;

    const CHAIN_SECRET: &str = "chain-secret";

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[allow(clippy::type_complexity)]
    async fn intake() -> (
        WebhookIntake,
        Arc<MemoryUserStore>,
        Arc<MemoryManagedWalletStore>,
        Arc<MemoryBalancesStore>,
        Arc<MemoryPasscodeStore>,
    ) {
        let users = Arc::new(MemoryUserStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let audit = Arc::new(MemoryAuditLog::new("secret"));
        let passcodes = Arc::new(MemoryPasscodeStore::new(5, 15 * 60, 10 * 60));
        let onboarding = Arc::new(OnboardingMachine::new(
            users.clone(),
            jobs.clone(),
            audit.clone(),
            passcodes.clone(),
            5,
            5,
        ));

        let wallets = Arc::new(MemoryManagedWalletStore::new());
        let balances = Arc::new(MemoryBalancesStore::new());
        let deposit_store = Arc::new(MemoryDepositStore::new());
        let offramp = Arc::new(MockOffRampAdapter);
        let deposits = Arc::new(DepositPipeline::new(
            deposit_store,
            wallets.clone(),
            balances.clone(),
            audit.clone(),
            jobs.clone(),
            offramp,
            5,
        ));

        let order_store = Arc::new(MemoryOrderStore::new());
        let positions = Arc::new(MemoryPositionStore::new());
        let baskets = Arc::new(MemoryBasketStore::new());
        let brokerage = Arc::new(MockBrokerageAdapter);
        let idempotency = Arc::new(IdempotencyBackend::Memory(MemoryIdempotencyLedger::new()));
        let orders = Arc::new(OrderEngine::new(
            order_store,
            positions,
            baskets,
            balances.clone(),
            brokerage,
            idempotency.clone(),
            audit,
            jobs,
            5,
            5,
        ));

        let kyc = Arc::new(MockKycAdapter);

        let intake = WebhookIntake::new(
            deposits,
            orders,
            onboarding,
            users.clone(),
            kyc,
            idempotency,
            CHAIN_SECRET,
            "brokerage-secret",
            "offramp-secret",
            "kyc-secret",
        );
        (intake, users, wallets, balances, passcodes)
    }

    #[tokio::test]
    async fn rejects_chain_deposit_with_bad_signature() {
        let (intake, _users, _wallets, _balances, _passcodes) = intake().await;
        let body = json!({
            "chain": "SOL-DEVNET", "tx_hash": "0xT1", "destination_address": "addr-1",
            "token": "USDC", "raw_amount": "10.00", "confirmations": 1, "confirmation_threshold": 1
        })
        .to_string();

        let result = intake.handle_chain_deposit(body.as_bytes(), "00").await;
        assert!(matches!(result, Err(CoreError::Forbidden(_))));
    }

    #[tokio::test]
    async fn credits_chain_deposit_exactly_once_on_redelivery() {
        let (intake, _users, wallets, balances, _passcodes) = intake().await;
        let user_id = Uuid::new_v4();
        wallets
            .upsert_live(user_id, "SOL-DEVNET", "pw-1", "addr-1", crate::adapters::wallet::WalletAccountType::Eoa)
            .await
            .unwrap();

        let body = json!({
            "chain": "SOL-DEVNET", "tx_hash": "0xT1", "destination_address": "addr-1",
            "token": "USDC", "raw_amount": "10.00", "confirmations": 1, "confirmation_threshold": 1
        })
        .to_string();
        let signature = sign(CHAIN_SECRET, body.as_bytes());

        let first = intake.handle_chain_deposit(body.as_bytes(), &signature).await.unwrap();
        let second = intake.handle_chain_deposit(body.as_bytes(), &signature).await.unwrap();
        assert_eq!(first, second);

        let balance = balances.get_or_create(user_id).await.unwrap();
        assert_eq!(balance.buying_power, D::new(1000, 2));
    }

    #[tokio::test]
    async fn kyc_approval_transitions_the_matched_user() {
        let (intake, users, _wallets, _balances, passcodes) = intake().await;
        let user = users
            .create(NewUser { email: Some("a@x.com".into()), phone: None, password_hash: "hash".into() })
            .await
            .unwrap();
        users
            .update(
                user.id,
                Box::new(|u| {
                    u.onboarding_status = crate::users::OnboardingStatus::KycProcessing;
                    u.kyc_provider_ref = Some("kyc-provider-ref-1".to_string());
                    Ok(())
                }),
            )
            .await
            .unwrap();
        passcodes.set(user.id, "1234").await.unwrap();
        passcodes.verify(user.id, "1234").await.unwrap();

        let body = json!({ "provider_ref": "kyc-provider-ref-1", "reviewAnswer": "GREEN" }).to_string();
        let signature = sign("kyc-secret", body.as_bytes());
        let outcome = intake.handle_kyc_callback(body.as_bytes(), &signature).await.unwrap();
        assert_eq!(outcome["user_id"], json!(user.id));

        let updated = users.get(user.id).await.unwrap().unwrap();
        assert_eq!(updated.onboarding_status, crate::users::OnboardingStatus::WalletsProvisioning);
    }

    #[tokio::test]
    async fn kyc_rejection_requires_no_passcode_session() {
        let (intake, users, _wallets, _balances, _passcodes) = intake().await;
        let user = users
            .create(NewUser { email: Some("b@x.com".into()), phone: None, password_hash: "hash".into() })
            .await
            .unwrap();
        users
            .update(
                user.id,
                Box::new(|u| {
                    u.onboarding_status = crate::users::OnboardingStatus::KycProcessing;
                    u.kyc_provider_ref = Some("kyc-provider-ref-2".to_string());
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let body = json!({ "provider_ref": "kyc-provider-ref-2", "reviewAnswer": "RED" }).to_string();
        let signature = sign("kyc-secret", body.as_bytes());
        intake.handle_kyc_callback(body.as_bytes(), &signature).await.unwrap();

        let updated = users.get(user.id).await.unwrap().unwrap();
        assert_eq!(updated.onboarding_status, crate::users::OnboardingStatus::Rejected);
    }
}
