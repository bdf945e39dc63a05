use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::{request::Parts, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::adapters::brokerage::{BrokerageAdapter, HttpBrokerageAdapter, MockBrokerageAdapter, OrderSide};
use crate::adapters::kyc::{HttpKycAdapter, KycAdapter, KycDocs, MockKycAdapter};
use crate::adapters::offramp::{HttpOffRampAdapter, MockOffRampAdapter, OffRampAdapter};
use crate::adapters::wallet::{HttpWalletProviderAdapter, MockWalletProviderAdapter, WalletProviderAdapter};
use crate::audit::{AuditLog, MemoryAuditLog, PostgresAuditLog};
use crate::balances::{Balances, BalancesStore, MemoryBalancesStore};
use crate::config::Config;
use crate::db::InvestDb;
use crate::deposits::{Deposit, DepositPipeline, DepositStore, MemoryDepositStore};
use crate::error::CoreError;
use crate::idempotency::{IdempotencyBackend, MemoryIdempotencyLedger};
use crate::job_store::{JobStore, MemoryJobStore};
use crate::notifications::{Channel, HttpEmailChannel, HttpSmsChannel, MockChannel, NotificationFanout};
use crate::onboarding::{OnboardingEvent, OnboardingMachine};
use crate::orders::{
    BasketStore, MemoryBasketStore, MemoryOrderStore, MemoryPositionStore, Order, OrderEngine, OrderStore,
    OrderSubmissionWorker, Position, PositionStore,
};
use crate::security::{
    MemoryPasscodeStore, MemoryVerificationStore, PasscodeSession, PasscodeStore, VerificationChannel,
    VerificationStore,
};
use crate::users::{NewUser, User, UserStore};
use crate::wallet_provisioning::WalletProvisioningWorker;
use crate::wallets::{ManagedWallet, ManagedWalletStore, MemoryManagedWalletStore};
use crate::webhook_intake::WebhookIntake;

/// All storage, collaborators and background work the HTTP surface is built
/// on. Cloned per request; every field is an `Arc` or otherwise cheap to
/// clone, matching the shared-service-handle convention of the stores
/// themselves.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    db: Option<Arc<InvestDb>>,
    users: Arc<dyn UserStore>,
    verification: Arc<dyn VerificationStore>,
    passcodes: Arc<dyn PasscodeStore>,
    audit: Arc<dyn AuditLog>,
    balances: Arc<dyn BalancesStore>,
    wallets: Arc<dyn ManagedWalletStore>,
    deposit_store: Arc<dyn DepositStore>,
    orders_store: Arc<dyn OrderStore>,
    positions: Arc<dyn PositionStore>,
    baskets: Arc<dyn BasketStore>,
    jobs: Arc<dyn JobStore>,
    kyc: Arc<dyn KycAdapter>,
    onboarding: Arc<OnboardingMachine>,
    deposits: Arc<DepositPipeline>,
    order_engine: Arc<OrderEngine>,
    webhooks: Arc<WebhookIntake>,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let db = match config.database_url.clone() {
            Some(url) => Some(Arc::new(InvestDb::connect(&url, config.db_timeout_ms).await?)),
            None => None,
        };

        let users: Arc<dyn UserStore> = match db.clone() {
            Some(db) => Arc::new(crate::users::PostgresUserStore::new(db)),
            None => Arc::new(crate::users::MemoryUserStore::new()),
        };
        let audit: Arc<dyn AuditLog> = match db.clone() {
            Some(db) => Arc::new(PostgresAuditLog::new(config.audit_signing_secret.clone(), db)),
            None => Arc::new(MemoryAuditLog::new(config.audit_signing_secret.clone())),
        };
        let jobs: Arc<dyn JobStore> = match db.clone() {
            Some(db) => Arc::new(crate::job_store::PostgresJobStore::new(db)),
            None => Arc::new(MemoryJobStore::new()),
        };
        let balances: Arc<dyn BalancesStore> = match db.clone() {
            Some(db) => Arc::new(crate::balances::PostgresBalancesStore::new(db)),
            None => Arc::new(MemoryBalancesStore::new()),
        };
        let wallets: Arc<dyn ManagedWalletStore> = match db.clone() {
            Some(db) => Arc::new(crate::wallets::PostgresManagedWalletStore::new(db)),
            None => Arc::new(MemoryManagedWalletStore::new()),
        };
        let deposit_store: Arc<dyn DepositStore> = match db.clone() {
            Some(db) => Arc::new(crate::deposits::PostgresDepositStore::new(db)),
            None => Arc::new(MemoryDepositStore::new()),
        };
        let orders_store: Arc<dyn OrderStore> = match db.clone() {
            Some(db) => Arc::new(crate::orders::PostgresOrderStore::new(db)),
            None => Arc::new(MemoryOrderStore::new()),
        };
        let positions: Arc<dyn PositionStore> = match db.clone() {
            Some(db) => Arc::new(crate::orders::PostgresPositionStore::new(db)),
            None => Arc::new(MemoryPositionStore::new()),
        };
        let baskets: Arc<dyn BasketStore> = match db.clone() {
            Some(db) => Arc::new(crate::orders::PostgresBasketStore::new(db)),
            None => Arc::new(MemoryBasketStore::new()),
        };
        // Verification codes and passcode lockout state are short-lived and
        // never need to survive a restart, so only a memory backend exists.
        let verification: Arc<dyn VerificationStore> = Arc::new(MemoryVerificationStore::new(
            config.verification_code_ttl_seconds,
            config.verification_code_max_attempts,
            config.verification_resend_min_interval_seconds,
        ));
        let passcodes: Arc<dyn PasscodeStore> = Arc::new(MemoryPasscodeStore::new(
            config.passcode_lockout_threshold,
            config.passcode_lockout_seconds,
            config.passcode_session_ttl_seconds,
        ));

        let kyc: Arc<dyn KycAdapter> = match &config.kyc_provider_base_url {
            Some(url) => Arc::new(HttpKycAdapter::new(url.clone(), config.adapter_timeouts.kyc_call_ms)),
            None => Arc::new(MockKycAdapter),
        };
        let wallet_provider: Arc<dyn WalletProviderAdapter> = match &config.wallet_provider_base_url {
            Some(url) => Arc::new(HttpWalletProviderAdapter::new(
                url.clone(),
                config.adapter_timeouts.wallet_call_ms,
                config.required_wallet_chains.clone(),
            )),
            None => Arc::new(MockWalletProviderAdapter::new(config.required_wallet_chains.clone(), Vec::new())),
        };
        let offramp: Arc<dyn OffRampAdapter> = match &config.offramp_provider_base_url {
            Some(url) => Arc::new(HttpOffRampAdapter::new(url.clone(), config.adapter_timeouts.offramp_call_ms)),
            None => Arc::new(MockOffRampAdapter),
        };
        let brokerage: Arc<dyn BrokerageAdapter> = match &config.brokerage_base_url {
            Some(url) => Arc::new(HttpBrokerageAdapter::new(url.clone(), config.adapter_timeouts.brokerage_call_ms)),
            None => Arc::new(MockBrokerageAdapter),
        };
        let email_channel: Arc<dyn Channel> = match &config.email_provider_base_url {
            Some(url) => Arc::new(HttpEmailChannel::new(url.clone(), config.webhook_timeout_ms)),
            None => Arc::new(MockChannel::new()),
        };
        let sms_channel: Arc<dyn Channel> = match &config.sms_provider_base_url {
            Some(url) => Arc::new(HttpSmsChannel::new(url.clone(), config.webhook_timeout_ms)),
            None => Arc::new(MockChannel::new()),
        };

        let idempotency = Arc::new(match db.clone() {
            Some(db) => IdempotencyBackend::Postgres(crate::idempotency::PostgresIdempotencyLedger::new(db)),
            None => IdempotencyBackend::Memory(MemoryIdempotencyLedger::new()),
        });

        let onboarding = Arc::new(OnboardingMachine::new(
            users.clone(),
            jobs.clone(),
            audit.clone(),
            passcodes.clone(),
            config.job_max_attempts,
            config.notification_max_attempts,
        ));

        let deposits = Arc::new(DepositPipeline::new(
            deposit_store.clone(),
            wallets.clone(),
            balances.clone(),
            audit.clone(),
            jobs.clone(),
            offramp.clone(),
            config.notification_max_attempts,
        ));

        let order_engine = Arc::new(OrderEngine::new(
            orders_store.clone(),
            positions.clone(),
            baskets.clone(),
            balances.clone(),
            brokerage.clone(),
            idempotency.clone(),
            audit.clone(),
            jobs.clone(),
            config.job_max_attempts,
            config.notification_max_attempts,
        ));

        let webhooks = Arc::new(WebhookIntake::new(
            deposits.clone(),
            order_engine.clone(),
            onboarding.clone(),
            users.clone(),
            kyc.clone(),
            idempotency.clone(),
            config.hmac_secret_chain.clone(),
            config.hmac_secret_brokerage.clone(),
            config.hmac_secret_offramp.clone(),
            config.hmac_secret_kyc.clone(),
        ));

        let shutdown = CancellationToken::new();

        let state = Self {
            config,
            db,
            users,
            verification,
            passcodes,
            audit,
            balances,
            wallets,
            deposit_store,
            orders_store,
            positions,
            baskets,
            jobs,
            kyc,
            onboarding,
            deposits,
            order_engine,
            webhooks,
            shutdown,
            started_at: Utc::now(),
        };

        spawn_workers(&state, wallet_provider, email_channel, sms_channel);

        Ok(state)
    }
}

/// Spawns the job-queue workers that drive onboarding/orders forward off
/// the request path. Each worker owns its own clone of the collaborators it
/// needs and stops draining as soon as `state.shutdown` fires.
fn spawn_workers(
    state: &AppState,
    wallet_provider: Arc<dyn WalletProviderAdapter>,
    email_channel: Arc<dyn Channel>,
    sms_channel: Arc<dyn Channel>,
) {
    let poll_interval = std::time::Duration::from_millis(state.config.job_poll_interval_ms);

    let wallet_worker = WalletProvisioningWorker::new(
        format!("{}-wallets", state.config.service_name),
        state.jobs.clone(),
        state.wallets.clone(),
        wallet_provider,
        state.audit.clone(),
        state.onboarding.clone(),
        poll_interval,
        state.config.worker_concurrency,
        state.config.wallet_fanout_concurrency,
        state.config.job_lease_ttl_seconds,
        state.config.job_max_attempts,
        state.config.job_backoff_base_seconds,
        state.config.job_backoff_cap_seconds,
    );
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move { wallet_worker.run(shutdown).await });

    let order_worker = OrderSubmissionWorker::new(
        format!("{}-orders", state.config.service_name),
        state.jobs.clone(),
        state.order_engine.clone(),
        poll_interval,
        state.config.worker_concurrency,
        state.config.job_lease_ttl_seconds,
        state.config.job_backoff_base_seconds,
        state.config.job_backoff_cap_seconds,
    );
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move { order_worker.run(shutdown).await });

    let fanout = NotificationFanout::new(
        format!("{}-notifications", state.config.service_name),
        state.jobs.clone(),
        state.users.clone(),
        email_channel,
        sms_channel,
        state.config.notification_rate_per_hour,
        state.config.notification_min_gap_seconds,
        state.config.notification_dedupe_window_seconds,
        poll_interval,
        state.config.job_lease_ttl_seconds,
        state.config.job_backoff_base_seconds,
        state.config.job_backoff_cap_seconds,
    );
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move { fanout.run(shutdown).await });
}

pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
    AppState::new(config).await
}

pub async fn build_app(config: Config) -> anyhow::Result<Router> {
    Ok(build_router(build_state(config).await?))
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr;
    let shutdown_grace = std::time::Duration::from_secs(config.shutdown_grace_seconds);
    let state = build_state(config).await?;
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "investcore listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            tokio::time::sleep(shutdown_grace).await;
        })
        .await?;
    Ok(())
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.is_empty() {
        AllowOrigin::exact(HeaderValue::from_static("null"))
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };
    CorsLayer::new().allow_origin(allow_origin).allow_methods(Any)
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allowed_origins);
    Router::new()
        .route("/healthz", get(health))
        .route("/auth/register", post(register))
        .route("/auth/verify-code", post(verify_code))
        .route("/auth/resend-code", post(resend_code))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route(
            "/security/passcode",
            get(get_passcode_status).post(set_passcode).put(set_passcode).delete(delete_passcode),
        )
        .route("/security/passcode/verify", post(verify_passcode))
        .route("/onboarding/start", post(onboarding_start))
        .route("/onboarding/status", get(onboarding_status))
        .route("/onboarding/kyc/submit", post(onboarding_kyc_submit))
        .route("/wallets/initiate", post(wallets_initiate))
        .route("/wallets/:chain/address", get(wallet_address))
        .route("/wallet/status", get(wallet_status))
        .route("/funding/deposit/address", post(funding_deposit_address))
        .route("/funding/confirmations", get(funding_confirmations))
        .route("/balances", get(get_balances))
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/portfolio", get(portfolio))
        .route("/webhooks/chain-deposit", post(webhook_chain_deposit))
        .route("/webhooks/brokerage-fill", post(webhook_brokerage_fill))
        .route("/webhooks/kyc/callback/:provider_ref", post(webhook_kyc_callback))
        .route("/webhooks/off-ramp", post(webhook_off_ramp))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

// ---------------------------------------------------------------------
// Dev-only bearer auth. Production deployments replace this extractor
// with one backed by the external IdP; kept as a stand-in so handlers
// have something to pull `user_id` from today.
// ---------------------------------------------------------------------

pub struct AuthenticatedUser {
    pub user_id: Uuid,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(CoreError::Unauthenticated)?;
        let token = header.strip_prefix("Bearer ").ok_or(CoreError::Unauthenticated)?;

        let raw_user_id = match &state.config.dev_auth_shared_secret {
            Some(secret) => token
                .strip_prefix(secret.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .ok_or(CoreError::Unauthenticated)?,
            None => token,
        };

        let user_id = Uuid::parse_str(raw_user_id).map_err(|_| CoreError::Unauthenticated)?;
        Ok(AuthenticatedUser { user_id })
    }
}

// ---------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
    db_configured: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        db_configured: state.db.is_some(),
    })
}

// ---------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterBody {
    email: Option<String>,
    phone: Option<String>,
    password: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    user_id: Uuid,
    onboarding_status: &'static str,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<RegisterResponse>), CoreError> {
    let user = state
        .users
        .create(NewUser {
            email: body.email.clone(),
            phone: body.phone.clone(),
            password_hash: crate::security::hash_password(&body.password),
        })
        .await?;

    let identifier = user.canonical_identifier();
    let channel = if body.email.is_some() {
        VerificationChannel::Email
    } else {
        VerificationChannel::Sms
    };
    state.verification.issue(channel, &identifier, None).await?;

    let user = state.onboarding.transition(user.id, OnboardingEvent::Signup, "user").await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id,
            onboarding_status: user.onboarding_status.as_str(),
        }),
    ))
}

#[derive(Deserialize)]
struct VerifyCodeBody {
    identifier: String,
    channel: VerificationChannel,
    code: String,
}

async fn verify_code(
    State(state): State<AppState>,
    Json(body): Json<VerifyCodeBody>,
) -> Result<Json<RegisterResponse>, CoreError> {
    state.verification.verify(body.channel, &body.identifier, &body.code).await?;

    let user = state
        .users
        .get_by_identifier(&body.identifier)
        .await?
        .ok_or_else(|| CoreError::NotFound("user".to_string()))?;
    let user_id = user.id;
    let channel = body.channel;
    state
        .users
        .update(
            user_id,
            Box::new(move |u| {
                match channel {
                    VerificationChannel::Email => u.email_verified = true,
                    VerificationChannel::Sms => u.phone_verified = true,
                }
                Ok(())
            }),
        )
        .await?;

    let user = state.onboarding.transition(user_id, OnboardingEvent::CodeVerified, "user").await?;
    Ok(Json(RegisterResponse {
        user_id: user.id,
        onboarding_status: user.onboarding_status.as_str(),
    }))
}

#[derive(Deserialize)]
struct ResendCodeBody {
    identifier: String,
    channel: VerificationChannel,
}

async fn resend_code(State(state): State<AppState>, Json(body): Json<ResendCodeBody>) -> Result<StatusCode, CoreError> {
    state.verification.issue(body.channel, &body.identifier, None).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct LoginBody {
    identifier: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    user_id: Uuid,
    bearer_token: String,
}

async fn login(State(state): State<AppState>, Json(body): Json<LoginBody>) -> Result<Json<LoginResponse>, CoreError> {
    let user = state
        .users
        .get_by_identifier(&body.identifier)
        .await?
        .ok_or(CoreError::Unauthenticated)?;
    if !crate::security::verify_password(&body.password, &user.password_hash) {
        return Err(CoreError::Unauthenticated);
    }
    if !user.active {
        return Err(CoreError::Forbidden("account deactivated".to_string()));
    }
    Ok(Json(LoginResponse {
        user_id: user.id,
        bearer_token: bearer_token_for(&state, user.id),
    }))
}

fn bearer_token_for(state: &AppState, user_id: Uuid) -> String {
    match &state.config.dev_auth_shared_secret {
        Some(secret) => format!("{secret}:{user_id}"),
        None => user_id.to_string(),
    }
}

async fn refresh(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<LoginResponse>, CoreError> {
    Ok(Json(LoginResponse {
        user_id: user.user_id,
        bearer_token: bearer_token_for(&state, user.user_id),
    }))
}

async fn logout(_user: AuthenticatedUser) -> StatusCode {
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------
// Security / passcode
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct PasscodeStatus {
    has_fresh_session: bool,
}

async fn get_passcode_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<PasscodeStatus>, CoreError> {
    let has_fresh_session = state.passcodes.has_fresh_session(user.user_id).await?;
    Ok(Json(PasscodeStatus { has_fresh_session }))
}

#[derive(Deserialize)]
struct SetPasscodeBody {
    pin: String,
}

async fn set_passcode(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<SetPasscodeBody>,
) -> Result<StatusCode, CoreError> {
    state.passcodes.set(user.user_id, &body.pin).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_passcode(_user: AuthenticatedUser) -> Result<StatusCode, CoreError> {
    Err(CoreError::Validation(
        "passcode removal is not supported; set a new passcode instead".to_string(),
    ))
}

#[derive(Serialize)]
struct PasscodeSessionResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

impl From<PasscodeSession> for PasscodeSessionResponse {
    fn from(session: PasscodeSession) -> Self {
        Self {
            token: session.token,
            expires_at: session.expires_at,
        }
    }
}

async fn verify_passcode(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<SetPasscodeBody>,
) -> Result<Json<PasscodeSessionResponse>, CoreError> {
    let session = state.passcodes.verify(user.user_id, &body.pin).await?;
    Ok(Json(session.into()))
}

// ---------------------------------------------------------------------
// Onboarding
// ---------------------------------------------------------------------

async fn onboarding_start(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<User>, CoreError> {
    let user = state.onboarding.transition(user.user_id, OnboardingEvent::Signup, "user").await?;
    Ok(Json(user))
}

async fn onboarding_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<User>, CoreError> {
    let user = state
        .users
        .get(user.user_id)
        .await?
        .ok_or_else(|| CoreError::NotFound("user".to_string()))?;
    Ok(Json(user))
}

#[derive(Deserialize)]
struct KycSubmitBody {
    document_type: String,
    document_front_url: String,
    document_back_url: Option<String>,
    selfie_url: String,
}

async fn onboarding_kyc_submit(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<KycSubmitBody>,
) -> Result<Json<User>, CoreError> {
    let docs = KycDocs {
        document_type: body.document_type,
        document_front_url: body.document_front_url,
        document_back_url: body.document_back_url,
        selfie_url: body.selfie_url,
    };
    let initiation = state
        .kyc
        .initiate(&user.user_id.to_string(), &docs)
        .await
        .map_err(CoreError::from)?;

    let user_id = user.user_id;
    state
        .users
        .update(
            user_id,
            Box::new(move |u| {
                u.kyc_provider_ref = Some(initiation.provider_ref.clone());
                u.kyc_status = crate::users::KycStatus::Processing;
                Ok(())
            }),
        )
        .await?;

    let user = state.onboarding.transition(user_id, OnboardingEvent::KycSubmitted, "user").await?;
    Ok(Json(user))
}

// ---------------------------------------------------------------------
// Wallets
// ---------------------------------------------------------------------

async fn wallets_initiate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<User>, CoreError> {
    let user = state
        .onboarding
        .transition(user.user_id, OnboardingEvent::KycApproved, "user")
        .await?;
    Ok(Json(user))
}

async fn wallet_address(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(chain): Path<String>,
) -> Result<Json<ManagedWallet>, CoreError> {
    let wallet = state
        .wallets
        .get(user.user_id, &chain)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("wallet for chain {chain}")))?;
    Ok(Json(wallet))
}

async fn wallet_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<ManagedWallet>>, CoreError> {
    Ok(Json(state.wallets.list_for_user(user.user_id).await?))
}

// ---------------------------------------------------------------------
// Funding
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct DepositAddressBody {
    chain: String,
}

async fn funding_deposit_address(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<DepositAddressBody>,
) -> Result<Json<ManagedWallet>, CoreError> {
    let wallet = state
        .wallets
        .get(user.user_id, &body.chain)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("wallet for chain {}", body.chain)))?;
    Ok(Json(wallet))
}

#[derive(Deserialize)]
struct ConfirmationsQuery {
    chain: String,
    tx_hash: String,
}

async fn funding_confirmations(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    axum::extract::Query(query): axum::extract::Query<ConfirmationsQuery>,
) -> Result<Json<Deposit>, CoreError> {
    let deposit = state
        .deposit_store
        .get(&query.chain, &query.tx_hash)
        .await?
        .ok_or_else(|| CoreError::NotFound("deposit".to_string()))?;
    Ok(Json(deposit))
}

async fn get_balances(State(state): State<AppState>, user: AuthenticatedUser) -> Result<Json<Balances>, CoreError> {
    Ok(Json(state.balances.get_or_create(user.user_id).await?))
}

// ---------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateOrderBody {
    basket_id: Uuid,
    side: crate::orders::OrderSide,
    notional_amount: Decimal,
}

async fn create_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateOrderBody>,
) -> Result<(StatusCode, Json<Order>), CoreError> {
    let order = state
        .order_engine
        .create_order(user.user_id, body.basket_id, body.side, body.notional_amount)
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn list_orders(State(state): State<AppState>, user: AuthenticatedUser) -> Result<Json<Vec<Order>>, CoreError> {
    Ok(Json(state.orders_store.list_for_user(user.user_id).await?))
}

async fn get_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, CoreError> {
    let order = state
        .orders_store
        .get(id)
        .await?
        .ok_or_else(|| CoreError::NotFound("order".to_string()))?;
    if order.user_id != user.user_id {
        return Err(CoreError::Forbidden("order does not belong to this user".to_string()));
    }
    Ok(Json(order))
}

#[derive(Serialize)]
struct PortfolioResponse {
    balances: Balances,
    positions: Vec<Position>,
}

async fn portfolio(State(state): State<AppState>, user: AuthenticatedUser) -> Result<Json<PortfolioResponse>, CoreError> {
    Ok(Json(PortfolioResponse {
        balances: state.balances.get_or_create(user.user_id).await?,
        positions: state.positions.list_for_user(user.user_id).await?,
    }))
}

// ---------------------------------------------------------------------
// Webhooks — HMAC-verified, no bearer auth.
// ---------------------------------------------------------------------

fn signature_header(headers: &HeaderMap) -> Result<&str, CoreError> {
    headers
        .get("X-Signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| CoreError::Validation("missing X-Signature header".to_string()))
}

async fn webhook_chain_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, CoreError> {
    let signature = signature_header(&headers)?;
    Ok(Json(state.webhooks.handle_chain_deposit(&body, signature).await?))
}

async fn webhook_brokerage_fill(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, CoreError> {
    let signature = signature_header(&headers)?;
    Ok(Json(state.webhooks.handle_brokerage_fill(&body, signature).await?))
}

async fn webhook_kyc_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(_provider_ref): Path<String>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, CoreError> {
    let signature = signature_header(&headers)?;
    Ok(Json(state.webhooks.handle_kyc_callback(&body, signature).await?))
}

async fn webhook_off_ramp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, CoreError> {
    let signature = signature_header(&headers)?;
    Ok(Json(state.webhooks.handle_off_ramp(&body, signature).await?))
}
