use std::{collections::HashSet, env, net::SocketAddr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid INVESTCORE_BIND_ADDR: {0}")]
    BindAddr(String),
    #[error("invalid {field}: {value} ({reason})")]
    Numeric {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("INVESTCORE_REQUIRED_WALLET_CHAINS names unconfigured chain {0}")]
    UnknownRequiredChain(String),
    #[error("INVESTCORE_REQUIRED_WALLET_CHAINS names mainnet chain {0}; only testnet chains may be provisioned under current policy")]
    MainnetChainRequired(String),
}

/// Per-chain wallet provider configuration. `testnet` mirrors §3's policy
/// invariant: only testnet chains may be provisioned under current policy.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub chain: String,
    pub testnet: bool,
    pub confirmation_threshold: u32,
    pub token_decimals: u32,
}

#[derive(Clone, Debug)]
pub struct AdapterTimeouts {
    pub kyc_call_ms: u64,
    pub wallet_call_ms: u64,
    pub offramp_call_ms: u64,
    pub brokerage_call_ms: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub service_name: String,
    pub database_url: Option<String>,

    pub hmac_secret_chain: String,
    pub hmac_secret_brokerage: String,
    pub hmac_secret_offramp: String,
    pub hmac_secret_kyc: String,
    pub audit_signing_secret: String,

    pub job_poll_interval_ms: u64,
    pub worker_concurrency: usize,
    pub wallet_fanout_concurrency: usize,
    pub job_max_attempts: u32,
    pub job_backoff_base_seconds: u64,
    pub job_backoff_cap_seconds: u64,
    pub job_lease_ttl_seconds: i64,

    pub verification_code_ttl_seconds: i64,
    pub verification_code_max_attempts: u32,
    pub verification_resend_min_interval_seconds: i64,

    pub passcode_session_ttl_seconds: i64,
    pub passcode_lockout_threshold: u32,
    pub passcode_lockout_seconds: i64,

    pub db_timeout_ms: u64,
    pub adapter_timeouts: AdapterTimeouts,
    pub webhook_timeout_ms: u64,
    pub shutdown_grace_seconds: u64,

    pub notification_rate_per_hour: u32,
    pub notification_min_gap_seconds: i64,
    pub notification_dedupe_window_seconds: i64,
    pub notification_max_attempts: u32,

    pub cors_allowed_origins: Vec<String>,
    pub required_wallet_chains: Vec<String>,
    pub chains: Vec<ChainConfig>,

    pub wallet_provider_base_url: Option<String>,
    pub kyc_provider_base_url: Option<String>,
    pub offramp_provider_base_url: Option<String>,
    pub brokerage_base_url: Option<String>,
    pub email_provider_base_url: Option<String>,
    pub sms_provider_base_url: Option<String>,

    /// Dev-only bearer auth: accepts `Authorization: Bearer <user-id>` with
    /// no signature. A real deployment replaces `AuthenticatedUser` with a
    /// collaborator backed by this secret or an external IdP; kept so the
    /// binary has something to compare against in the meantime.
    pub dev_auth_shared_secret: Option<String>,
}

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8090";
const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_WORKER_CONCURRENCY: usize = 10;
const DEFAULT_WALLET_FANOUT_CONCURRENCY: usize = 4;
const DEFAULT_JOB_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_JOB_BACKOFF_BASE_SECONDS: u64 = 30;
const DEFAULT_JOB_BACKOFF_CAP_SECONDS: u64 = 30 * 60;
const DEFAULT_JOB_LEASE_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_VERIFICATION_CODE_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_VERIFICATION_CODE_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_VERIFICATION_RESEND_MIN_INTERVAL_SECONDS: i64 = 60;
const DEFAULT_PASSCODE_SESSION_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_PASSCODE_LOCKOUT_THRESHOLD: u32 = 5;
const DEFAULT_PASSCODE_LOCKOUT_SECONDS: i64 = 15 * 60;
const DEFAULT_DB_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 30;
const DEFAULT_NOTIFICATION_RATE_PER_HOUR: u32 = 10;
const DEFAULT_NOTIFICATION_MIN_GAP_SECONDS: i64 = 1;
const DEFAULT_NOTIFICATION_DEDUPE_WINDOW_SECONDS: i64 = 60;
const DEFAULT_NOTIFICATION_MAX_ATTEMPTS: u32 = 5;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("INVESTCORE_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(|error| ConfigError::BindAddr(format!("{error}")))?;

        let service_name =
            env::var("INVESTCORE_SERVICE_NAME").unwrap_or_else(|_| "investcore".to_string());

        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        let hmac_secret_chain = env::var("INVESTCORE_HMAC_SECRET_CHAIN")
            .unwrap_or_else(|_| "dev-chain-webhook-secret".to_string());
        let hmac_secret_brokerage = env::var("INVESTCORE_HMAC_SECRET_BROKERAGE")
            .unwrap_or_else(|_| "dev-brokerage-webhook-secret".to_string());
        let hmac_secret_offramp = env::var("INVESTCORE_HMAC_SECRET_OFFRAMP")
            .unwrap_or_else(|_| "dev-offramp-webhook-secret".to_string());
        let hmac_secret_kyc = env::var("INVESTCORE_HMAC_SECRET_KYC")
            .unwrap_or_else(|_| "dev-kyc-webhook-secret".to_string());
        let audit_signing_secret = env::var("INVESTCORE_AUDIT_SIGNING_SECRET")
            .unwrap_or_else(|_| "dev-audit-signing-secret".to_string());

        let job_poll_interval_ms = parse_u64_env(
            "INVESTCORE_JOB_POLL_INTERVAL_MS",
            DEFAULT_JOB_POLL_INTERVAL_MS,
        )?;
        let worker_concurrency = parse_usize_env(
            "INVESTCORE_WORKER_CONCURRENCY",
            DEFAULT_WORKER_CONCURRENCY,
        )?;
        let wallet_fanout_concurrency = parse_usize_env(
            "INVESTCORE_WALLET_FANOUT_CONCURRENCY",
            DEFAULT_WALLET_FANOUT_CONCURRENCY,
        )?;
        let job_max_attempts =
            parse_u32_env("INVESTCORE_JOB_MAX_ATTEMPTS", DEFAULT_JOB_MAX_ATTEMPTS)?;
        let job_backoff_base_seconds = parse_u64_env(
            "INVESTCORE_JOB_BACKOFF_BASE_SECONDS",
            DEFAULT_JOB_BACKOFF_BASE_SECONDS,
        )?;
        let job_backoff_cap_seconds = parse_u64_env(
            "INVESTCORE_JOB_BACKOFF_CAP_SECONDS",
            DEFAULT_JOB_BACKOFF_CAP_SECONDS,
        )?;
        let job_lease_ttl_seconds = parse_i64_env(
            "INVESTCORE_JOB_LEASE_TTL_SECONDS",
            DEFAULT_JOB_LEASE_TTL_SECONDS,
        )?;

        let verification_code_ttl_seconds = parse_i64_env(
            "INVESTCORE_VERIFICATION_CODE_TTL_SECONDS",
            DEFAULT_VERIFICATION_CODE_TTL_SECONDS,
        )?;
        let verification_code_max_attempts = parse_u32_env(
            "INVESTCORE_VERIFICATION_CODE_MAX_ATTEMPTS",
            DEFAULT_VERIFICATION_CODE_MAX_ATTEMPTS,
        )?;
        let verification_resend_min_interval_seconds = parse_i64_env(
            "INVESTCORE_VERIFICATION_RESEND_MIN_INTERVAL_SECONDS",
            DEFAULT_VERIFICATION_RESEND_MIN_INTERVAL_SECONDS,
        )?;

        let passcode_session_ttl_seconds = parse_i64_env(
            "INVESTCORE_PASSCODE_SESSION_TTL_SECONDS",
            DEFAULT_PASSCODE_SESSION_TTL_SECONDS,
        )?;
        let passcode_lockout_threshold = parse_u32_env(
            "INVESTCORE_PASSCODE_LOCKOUT_THRESHOLD",
            DEFAULT_PASSCODE_LOCKOUT_THRESHOLD,
        )?;
        let passcode_lockout_seconds = parse_i64_env(
            "INVESTCORE_PASSCODE_LOCKOUT_SECONDS",
            DEFAULT_PASSCODE_LOCKOUT_SECONDS,
        )?;

        let db_timeout_ms = parse_u64_env("INVESTCORE_DB_TIMEOUT_MS", DEFAULT_DB_TIMEOUT_MS)?;
        let adapter_timeouts = AdapterTimeouts {
            kyc_call_ms: parse_u64_env("INVESTCORE_ADAPTER_KYC_TIMEOUT_MS", 20_000)?,
            wallet_call_ms: parse_u64_env("INVESTCORE_ADAPTER_WALLET_TIMEOUT_MS", 30_000)?,
            offramp_call_ms: parse_u64_env("INVESTCORE_ADAPTER_OFFRAMP_TIMEOUT_MS", 15_000)?,
            brokerage_call_ms: parse_u64_env("INVESTCORE_ADAPTER_BROKERAGE_TIMEOUT_MS", 5_000)?,
        };
        let webhook_timeout_ms =
            parse_u64_env("INVESTCORE_WEBHOOK_TIMEOUT_MS", DEFAULT_WEBHOOK_TIMEOUT_MS)?;
        let shutdown_grace_seconds = parse_u64_env(
            "INVESTCORE_SHUTDOWN_GRACE_SECONDS",
            DEFAULT_SHUTDOWN_GRACE_SECONDS,
        )?;

        let notification_rate_per_hour = parse_u32_env(
            "INVESTCORE_NOTIFICATION_RATE_PER_HOUR",
            DEFAULT_NOTIFICATION_RATE_PER_HOUR,
        )?;
        let notification_min_gap_seconds = parse_i64_env(
            "INVESTCORE_NOTIFICATION_MIN_GAP_SECONDS",
            DEFAULT_NOTIFICATION_MIN_GAP_SECONDS,
        )?;
        let notification_dedupe_window_seconds = parse_i64_env(
            "INVESTCORE_NOTIFICATION_DEDUPE_WINDOW_SECONDS",
            DEFAULT_NOTIFICATION_DEDUPE_WINDOW_SECONDS,
        )?;
        let notification_max_attempts = parse_u32_env(
            "INVESTCORE_NOTIFICATION_MAX_ATTEMPTS",
            DEFAULT_NOTIFICATION_MAX_ATTEMPTS,
        )?;

        let cors_allowed_origins = env::var("INVESTCORE_CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let required_wallet_chains = env::var("INVESTCORE_REQUIRED_WALLET_CHAINS")
            .unwrap_or_else(|_| "SOL-DEVNET,APTOS-TESTNET".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let chains = default_chains();
        let known_chains = chain_set(&chains);
        for chain in &required_wallet_chains {
            if !known_chains.contains(chain) {
                return Err(ConfigError::UnknownRequiredChain(chain.clone()));
            }
            if chains.iter().any(|c| &c.chain == chain && !c.testnet) {
                return Err(ConfigError::MainnetChainRequired(chain.clone()));
            }
        }

        let wallet_provider_base_url = env::var("INVESTCORE_WALLET_PROVIDER_BASE_URL").ok().filter(|v| !v.is_empty());
        let kyc_provider_base_url = env::var("INVESTCORE_KYC_PROVIDER_BASE_URL").ok().filter(|v| !v.is_empty());
        let offramp_provider_base_url = env::var("INVESTCORE_OFFRAMP_PROVIDER_BASE_URL").ok().filter(|v| !v.is_empty());
        let brokerage_base_url = env::var("INVESTCORE_BROKERAGE_BASE_URL").ok().filter(|v| !v.is_empty());
        let email_provider_base_url = env::var("INVESTCORE_EMAIL_PROVIDER_BASE_URL").ok().filter(|v| !v.is_empty());
        let sms_provider_base_url = env::var("INVESTCORE_SMS_PROVIDER_BASE_URL").ok().filter(|v| !v.is_empty());
        let dev_auth_shared_secret = env::var("INVESTCORE_DEV_AUTH_SHARED_SECRET").ok().filter(|v| !v.is_empty());

        Ok(Self {
            bind_addr,
            service_name,
            database_url,
            hmac_secret_chain,
            hmac_secret_brokerage,
            hmac_secret_offramp,
            hmac_secret_kyc,
            audit_signing_secret,
            job_poll_interval_ms,
            worker_concurrency,
            wallet_fanout_concurrency,
            job_max_attempts,
            job_backoff_base_seconds,
            job_backoff_cap_seconds,
            job_lease_ttl_seconds,
            verification_code_ttl_seconds,
            verification_code_max_attempts,
            verification_resend_min_interval_seconds,
            passcode_session_ttl_seconds,
            passcode_lockout_threshold,
            passcode_lockout_seconds,
            db_timeout_ms,
            adapter_timeouts,
            webhook_timeout_ms,
            shutdown_grace_seconds,
            notification_rate_per_hour,
            notification_min_gap_seconds,
            notification_dedupe_window_seconds,
            notification_max_attempts,
            cors_allowed_origins,
            required_wallet_chains,
            chains,
            wallet_provider_base_url,
            kyc_provider_base_url,
            offramp_provider_base_url,
            brokerage_base_url,
            email_provider_base_url,
            sms_provider_base_url,
            dev_auth_shared_secret,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::from_env().expect("default config parses")
    }
}

/// Only testnet chains are provisioned under current policy (§3).
fn default_chains() -> Vec<ChainConfig> {
    vec![
        ChainConfig {
            chain: "SOL-DEVNET".to_string(),
            testnet: true,
            confirmation_threshold: 1,
            token_decimals: 9,
        },
        ChainConfig {
            chain: "APTOS-TESTNET".to_string(),
            testnet: true,
            confirmation_threshold: 1,
            token_decimals: 8,
        },
        ChainConfig {
            chain: "MATIC-AMOY".to_string(),
            testnet: true,
            confirmation_threshold: 12,
            token_decimals: 18,
        },
    ]
}

fn parse_u64_env(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|error| ConfigError::Numeric {
            field: key,
            value: raw,
            reason: format!("{error}"),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_u32_env(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|error| ConfigError::Numeric {
            field: key,
            value: raw,
            reason: format!("{error}"),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_i64_env(key: &'static str, default: i64) -> Result<i64, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|error| ConfigError::Numeric {
            field: key,
            value: raw,
            reason: format!("{error}"),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_usize_env(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|error| ConfigError::Numeric {
            field: key,
            value: raw,
            reason: format!("{error}"),
        }),
        Err(_) => Ok(default),
    }
}

fn chain_set(chains: &[ChainConfig]) -> HashSet<String> {
    chains.iter().map(|c| c.chain.clone()).collect()
}
