use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStatus {
    Started,
    VerificationPending,
    KycPending,
    KycProcessing,
    WalletsProvisioning,
    Completed,
    Rejected,
}

impl OnboardingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::VerificationPending => "verification_pending",
            Self::KycPending => "kyc_pending",
            Self::KycProcessing => "kyc_processing",
            Self::WalletsProvisioning => "wallets_provisioning",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    Pending,
    Processing,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub role: Role,
    pub active: bool,
    pub onboarding_status: OnboardingStatus,
    pub kyc_status: KycStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kyc_provider_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Canonical identifier used for uniqueness and lookups: the lowercased
    /// email if present, else the phone digits. Canonicalization happens
    /// once at the edge (§9 Design Notes); everything downstream compares
    /// canonical form only.
    pub fn canonical_identifier(&self) -> Option<String> {
        self.email
            .as_deref()
            .map(canonicalize_email)
            .or_else(|| self.phone.clone())
    }
}

pub fn canonicalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password_hash: String,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Enforces case-insensitive email/phone uniqueness; returns `Conflict`
    /// on a duplicate canonical identifier.
    async fn create(&self, new_user: NewUser) -> Result<User, CoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<User>, CoreError>;

    async fn get_by_identifier(&self, identifier: &str) -> Result<Option<User>, CoreError>;

    /// Reverse lookup used by Webhook Intake to map an inbound KYC
    /// callback's `provider_ref` back to the user that initiated it.
    async fn find_by_kyc_provider_ref(&self, provider_ref: &str) -> Result<Option<User>, CoreError>;

    /// Row-locked update used by the onboarding state machine and admin
    /// resets; `mutate` receives the current row and returns the new one.
    /// Boxed rather than generic so the trait stays object-safe — callers
    /// hold `Arc<dyn UserStore>`.
    async fn update(
        &self,
        id: Uuid,
        mutate: Box<dyn FnOnce(&mut User) -> Result<(), CoreError> + Send>,
    ) -> Result<User, CoreError>;

    async fn deactivate(&self, id: Uuid) -> Result<(), CoreError>;
}

pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, new_user: NewUser) -> Result<User, CoreError> {
        if new_user.email.is_none() && new_user.phone.is_none() {
            return Err(CoreError::Validation(
                "exactly one of email or phone is required".to_string(),
            ));
        }
        let canonical_email = new_user.email.as_deref().map(canonicalize_email);

        let mut users = self.users.lock().await;
        let duplicate = users.values().any(|existing| {
            (canonical_email.is_some() && existing.email.as_deref().map(canonicalize_email) == canonical_email)
                || (new_user.phone.is_some() && existing.phone == new_user.phone)
        });
        if duplicate {
            return Err(CoreError::Conflict("identifier already registered".to_string()));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email,
            phone: new_user.phone,
            password_hash: new_user.password_hash,
            email_verified: false,
            phone_verified: false,
            role: Role::User,
            active: true,
            onboarding_status: OnboardingStatus::Started,
            kyc_status: KycStatus::Pending,
            kyc_provider_ref: None,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>, CoreError> {
        Ok(self.users.lock().await.get(&id).cloned())
    }

    async fn get_by_identifier(&self, identifier: &str) -> Result<Option<User>, CoreError> {
        let canonical = canonicalize_email(identifier);
        Ok(self
            .users
            .lock()
            .await
            .values()
            .find(|u| {
                u.email.as_deref().map(canonicalize_email).as_deref() == Some(canonical.as_str())
                    || u.phone.as_deref() == Some(identifier)
            })
            .cloned())
    }

    async fn find_by_kyc_provider_ref(&self, provider_ref: &str) -> Result<Option<User>, CoreError> {
        Ok(self
            .users
            .lock()
            .await
            .values()
            .find(|u| u.kyc_provider_ref.as_deref() == Some(provider_ref))
            .cloned())
    }

    async fn update(
        &self,
        id: Uuid,
        mutate: Box<dyn FnOnce(&mut User) -> Result<(), CoreError> + Send>,
    ) -> Result<User, CoreError> {
        let mut users = self.users.lock().await;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("user {id}")))?;
        mutate(user)?;
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), CoreError> {
        let mut users = self.users.lock().await;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("user {id}")))?;
        user.active = false;
        user.updated_at = Utc::now();
        Ok(())
    }
}

pub struct PostgresUserStore {
    db: Arc<crate::db::InvestDb>,
}

impl PostgresUserStore {
    pub fn new(db: Arc<crate::db::InvestDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PostgresUserStore {
    async fn create(&self, new_user: NewUser) -> Result<User, CoreError> {
        if new_user.email.is_none() && new_user.phone.is_none() {
            return Err(CoreError::Validation(
                "exactly one of email or phone is required".to_string(),
            ));
        }
        let client = self.db.client();
        let client = client.lock().await;
        let id = Uuid::new_v4();
        let now = Utc::now();
        client
            .execute(
                r#"
                INSERT INTO users (
                    id, email, phone, password_hash, email_verified, phone_verified,
                    role, active, onboarding_status, kyc_status, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, false, false, 'user', true, 'started', 'pending', $5, $5)
                "#,
                &[
                    &id,
                    &new_user.email.as_deref().map(canonicalize_email),
                    &new_user.phone,
                    &new_user.password_hash,
                    &now,
                ],
            )
            .await
            .map_err(|error| {
                if error.to_string().contains("unique") {
                    CoreError::Conflict("identifier already registered".to_string())
                } else {
                    CoreError::Internal(format!("user insert failed: {error}"))
                }
            })?;

        Ok(User {
            id,
            email: new_user.email,
            phone: new_user.phone,
            password_hash: new_user.password_hash,
            email_verified: false,
            phone_verified: false,
            role: Role::User,
            active: true,
            onboarding_status: OnboardingStatus::Started,
            kyc_status: KycStatus::Pending,
            kyc_provider_ref: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt("SELECT * FROM users WHERE id = $1", &[&id])
            .await
            .map_err(|error| CoreError::Internal(format!("user lookup failed: {error}")))?;
        Ok(row.as_ref().map(map_user_row))
    }

    async fn get_by_identifier(&self, identifier: &str) -> Result<Option<User>, CoreError> {
        let canonical = canonicalize_email(identifier);
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM users WHERE lower(email) = $1 OR phone = $2",
                &[&canonical, &identifier],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("user lookup failed: {error}")))?;
        Ok(row.as_ref().map(map_user_row))
    }

    async fn find_by_kyc_provider_ref(&self, provider_ref: &str) -> Result<Option<User>, CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt("SELECT * FROM users WHERE kyc_provider_ref = $1", &[&provider_ref])
            .await
            .map_err(|error| CoreError::Internal(format!("user lookup by kyc_provider_ref failed: {error}")))?;
        Ok(row.as_ref().map(map_user_row))
    }

    async fn update(
        &self,
        id: Uuid,
        mutate: Box<dyn FnOnce(&mut User) -> Result<(), CoreError> + Send>,
    ) -> Result<User, CoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CoreError::Internal(format!("user update tx failed: {error}")))?;
        let row = tx
            .query_one("SELECT * FROM users WHERE id = $1 FOR UPDATE", &[&id])
            .await
            .map_err(|_| CoreError::NotFound(format!("user {id}")))?;
        let mut user = map_user_row(&row);
        mutate(&mut user)?;
        user.updated_at = Utc::now();

        tx.execute(
            r#"
            UPDATE users SET email = $2, phone = $3, email_verified = $4, phone_verified = $5,
                   role = $6, active = $7, onboarding_status = $8, kyc_status = $9,
                   kyc_provider_ref = $10, updated_at = $11
             WHERE id = $1
            "#,
            &[
                &id,
                &user.email,
                &user.phone,
                &user.email_verified,
                &user.phone_verified,
                &role_str(user.role),
                &user.active,
                &user.onboarding_status.as_str(),
                &kyc_status_str(user.kyc_status),
                &user.kyc_provider_ref,
                &user.updated_at,
            ],
        )
        .await
        .map_err(|error| CoreError::Internal(format!("user update failed: {error}")))?;

        tx.commit()
            .await
            .map_err(|error| CoreError::Internal(format!("user update commit failed: {error}")))?;
        Ok(user)
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), CoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "UPDATE users SET active = false, updated_at = $2 WHERE id = $1",
                &[&id, &Utc::now()],
            )
            .await
            .map_err(|error| CoreError::Internal(format!("user deactivate failed: {error}")))?;
        Ok(())
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Admin => "admin",
        Role::SuperAdmin => "super_admin",
    }
}

fn kyc_status_str(status: KycStatus) -> &'static str {
    match status {
        KycStatus::Pending => "pending",
        KycStatus::Processing => "processing",
        KycStatus::Approved => "approved",
        KycStatus::Rejected => "rejected",
    }
}

fn map_user_row(row: &tokio_postgres::Row) -> User {
    let role_str: String = row.get("role");
    let kyc_str: String = row.get("kyc_status");
    let onboarding_str: String = row.get("onboarding_status");
    User {
        id: row.get("id"),
        email: row.get("email"),
        phone: row.get("phone"),
        password_hash: row.get("password_hash"),
        email_verified: row.get("email_verified"),
        phone_verified: row.get("phone_verified"),
        role: match role_str.as_str() {
            "admin" => Role::Admin,
            "super_admin" => Role::SuperAdmin,
            _ => Role::User,
        },
        active: row.get("active"),
        onboarding_status: match onboarding_str.as_str() {
            "verification_pending" => OnboardingStatus::VerificationPending,
            "kyc_pending" => OnboardingStatus::KycPending,
            "kyc_processing" => OnboardingStatus::KycProcessing,
            "wallets_provisioning" => OnboardingStatus::WalletsProvisioning,
            "completed" => OnboardingStatus::Completed,
            "rejected" => OnboardingStatus::Rejected,
            _ => OnboardingStatus::Started,
        },
        kyc_status: match kyc_str.as_str() {
            "processing" => KycStatus::Processing,
            "approved" => KycStatus::Approved,
            "rejected" => KycStatus::Rejected,
            _ => KycStatus::Pending,
        },
        kyc_provider_ref: row.get("kyc_provider_ref"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn email_uniqueness_is_case_insensitive() {
        let store = MemoryUserStore::new();
        store
            .create(NewUser {
                email: Some("a@x.com".to_string()),
                phone: None,
                password_hash: "hash".to_string(),
            })
            .await
            .unwrap();
        let result = store
            .create(NewUser {
                email: Some("A@X.com".to_string()),
                phone: None,
                password_hash: "hash".to_string(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn signup_requires_exactly_one_identifier() {
        let store = MemoryUserStore::new();
        let result = store
            .create(NewUser {
                email: None,
                phone: None,
                password_hash: "hash".to_string(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }
}
