use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::adapters::wallet::WalletAccountType;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Creating,
    Live,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedWallet {
    pub user_id: Uuid,
    pub chain: String,
    pub provider_wallet_id: String,
    pub address: String,
    pub account_type: WalletAccountType,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ManagedWalletStore: Send + Sync {
    /// Inserts a wallet; the unique `(user_id, chain)` key with a
    /// `status = 'live'` partial uniqueness is the serialization point
    /// (§5) — at most one live wallet per (user, chain).
    async fn upsert_live(
        &self,
        user_id: Uuid,
        chain: &str,
        provider_wallet_id: &str,
        address: &str,
        account_type: WalletAccountType,
    ) -> Result<ManagedWallet, CoreError>;

    async fn get(&self, user_id: Uuid, chain: &str) -> Result<Option<ManagedWallet>, CoreError>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<ManagedWallet>, CoreError>;

    /// Reverse lookup used by the deposit pipeline to map an observed
    /// on-chain destination address back to its owning user (§4.G).
    async fn resolve_by_address(&self, chain: &str, address: &str) -> Result<Option<Uuid>, CoreError>;
}

pub struct MemoryManagedWalletStore {
    wallets: Mutex<HashMap<(Uuid, String), ManagedWallet>>,
}

impl MemoryManagedWalletStore {
    pub fn new() -> Self {
        Self {
            wallets: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryManagedWalletStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagedWalletStore for MemoryManagedWalletStore {
    async fn upsert_live(
        &self,
        user_id: Uuid,
        chain: &str,
        provider_wallet_id: &str,
        address: &str,
        account_type: WalletAccountType,
    ) -> Result<ManagedWallet, CoreError> {
        let now = Utc::now();
        let mut wallets = self.wallets.lock().await;
        let key = (user_id, chain.to_string());
        if let Some(existing) = wallets.get(&key) {
            if existing.status == WalletStatus::Live {
                return Ok(existing.clone());
            }
        }
        let wallet = ManagedWallet {
            user_id,
            chain: chain.to_string(),
            provider_wallet_id: provider_wallet_id.to_string(),
            address: address.to_string(),
            account_type,
            status: WalletStatus::Live,
            created_at: now,
            updated_at: now,
        };
        wallets.insert(key, wallet.clone());
        Ok(wallet)
    }

    async fn get(&self, user_id: Uuid, chain: &str) -> Result<Option<ManagedWallet>, CoreError> {
        Ok(self
            .wallets
            .lock()
            .await
            .get(&(user_id, chain.to_string()))
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<ManagedWallet>, CoreError> {
        Ok(self
            .wallets
            .lock()
            .await
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn resolve_by_address(&self, chain: &str, address: &str) -> Result<Option<Uuid>, CoreError> {
        Ok(self
            .wallets
            .lock()
            .await
            .values()
            .find(|w| w.chain == chain && w.address == address && w.status == WalletStatus::Live)
            .map(|w| w.user_id))
    }
}

pub struct PostgresManagedWalletStore {
    db: Arc<crate::db::InvestDb>,
}

impl PostgresManagedWalletStore {
    pub fn new(db: Arc<crate::db::InvestDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ManagedWalletStore for PostgresManagedWalletStore {
    async fn upsert_live(
        &self,
        user_id: Uuid,
        chain: &str,
        provider_wallet_id: &str,
        address: &str,
        account_type: WalletAccountType,
    ) -> Result<ManagedWallet, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let now = Utc::now();
        let account_type_str = match account_type {
            WalletAccountType::Eoa => "EOA",
            WalletAccountType::Sca => "SCA",
        };
        let row = client
            .query_one(
                r#"
                INSERT INTO managed_wallets (
                    user_id, chain, provider_wallet_id, address, account_type, status,
                    created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, 'live', $6, $6)
                ON CONFLICT (user_id, chain) WHERE status = 'live'
                DO UPDATE SET provider_wallet_id = managed_wallets.provider_wallet_id
                RETURNING user_id, chain, provider_wallet_id, address, account_type, status,
                          created_at, updated_at
                "#,
                &[&user_id, &chain, &provider_wallet_id, &address, &account_type_str, &now],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("wallet upsert failed: {error}")))?;
        Ok(map_wallet_row(&row))
    }

    async fn get(&self, user_id: Uuid, chain: &str) -> Result<Option<ManagedWallet>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM managed_wallets WHERE user_id = $1 AND chain = $2",
                &[&user_id, &chain],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("wallet lookup failed: {error}")))?;
        Ok(row.as_ref().map(map_wallet_row))
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<ManagedWallet>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query("SELECT * FROM managed_wallets WHERE user_id = $1", &[&user_id])
            .await
            .map_err(|error| CoreError::Internal(format!("wallet list failed: {error}")))?;
        Ok(rows.iter().map(map_wallet_row).collect())
    }

    async fn resolve_by_address(&self, chain: &str, address: &str) -> Result<Option<Uuid>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT user_id FROM managed_wallets WHERE chain = $1 AND address = $2 AND status = 'live'",
                &[&chain, &address],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("wallet address lookup failed: {error}")))?;
        Ok(row.map(|r| r.get("user_id")))
    }
}

fn map_wallet_row(row: &tokio_postgres::Row) -> ManagedWallet {
    let account_type_str: String = row.get("account_type");
    let status_str: String = row.get("status");
    ManagedWallet {
        user_id: row.get("user_id"),
        chain: row.get("chain"),
        provider_wallet_id: row.get("provider_wallet_id"),
        address: row.get("address"),
        account_type: if account_type_str == "SCA" {
            WalletAccountType::Sca
        } else {
            WalletAccountType::Eoa
        },
        status: match status_str.as_str() {
            "live" => WalletStatus::Live,
            "failed" => WalletStatus::Failed,
            _ => WalletStatus::Creating,
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn at_most_one_live_wallet_per_user_chain() {
        let store = MemoryManagedWalletStore::new();
        let user_id = Uuid::new_v4();
        let first = store
            .upsert_live(user_id, "SOL-DEVNET", "pw-1", "addr-1", WalletAccountType::Eoa)
            .await
            .unwrap();
        let second = store
            .upsert_live(user_id, "SOL-DEVNET", "pw-2", "addr-2", WalletAccountType::Eoa)
            .await
            .unwrap();
        assert_eq!(first.provider_wallet_id, second.provider_wallet_id);
        assert_eq!(store.list_for_user(user_id).await.unwrap().len(), 1);
    }
}
