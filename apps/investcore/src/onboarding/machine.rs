use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::audit::{AuditEntryDraft, AuditLog};
use crate::error::CoreError;
use crate::job_store::JobStore;
use crate::security::PasscodeStore;
use crate::users::{OnboardingStatus, User, UserStore};

pub type OnboardingError = CoreError;

/// Events that drive the state machine forward (§4.D). `AdminOverride`
/// bypasses the transition table and is the only event that may move a user
/// between two non-terminal states arbitrarily.
#[derive(Debug, Clone)]
pub enum OnboardingEvent {
    Signup,
    CodeVerified,
    KycSubmitted,
    KycApproved,
    KycRejected,
    WalletsProvisioned,
    AdminOverride(OnboardingStatus),
}

/// Pure transition table, exhaustively matched and unit-tested against
/// every edge in the onboarding diagram. `None` means the event is not a
/// legal transition out of `current`.
pub fn next_state(current: OnboardingStatus, event: &OnboardingEvent) -> Option<OnboardingStatus> {
    use OnboardingEvent as E;
    use OnboardingStatus as S;
    match (current, event) {
        (S::Started, E::Signup) => Some(S::VerificationPending),
        (S::VerificationPending, E::CodeVerified) => Some(S::KycPending),
        (S::KycPending, E::KycSubmitted) => Some(S::KycProcessing),
        (S::KycProcessing, E::KycApproved) => Some(S::WalletsProvisioning),
        (S::KycProcessing, E::KycRejected) => Some(S::Rejected),
        (S::WalletsProvisioning, E::WalletsProvisioned) => Some(S::Completed),
        (_, E::AdminOverride(target)) => Some(*target),
        _ => None,
    }
}

pub struct OnboardingMachine {
    users: Arc<dyn UserStore>,
    jobs: Arc<dyn JobStore>,
    audit: Arc<dyn AuditLog>,
    passcodes: Arc<dyn PasscodeStore>,
    job_max_attempts: u32,
    notification_max_attempts: u32,
}

impl OnboardingMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<dyn UserStore>,
        jobs: Arc<dyn JobStore>,
        audit: Arc<dyn AuditLog>,
        passcodes: Arc<dyn PasscodeStore>,
        job_max_attempts: u32,
        notification_max_attempts: u32,
    ) -> Self {
        Self {
            users,
            jobs,
            audit,
            passcodes,
            job_max_attempts,
            notification_max_attempts,
        }
    }

    /// A transition is one atomic unit: new state + audit entry + follow-on
    /// jobs. `Store::update`'s row lock on the user serializes concurrent
    /// transitions for the same user; follow-on job enqueues are idempotent
    /// (dedupe key) so at-least-once delivery never double-provisions.
    pub async fn transition(
        &self,
        user_id: Uuid,
        event: OnboardingEvent,
        actor: &str,
    ) -> Result<User, OnboardingError> {
        if matches!(event, OnboardingEvent::KycApproved) {
            let has_session = self.passcodes.has_fresh_session(user_id).await?;
            if !has_session {
                return Err(CoreError::Locked(
                    "a fresh passcode session is required before wallet provisioning".to_string(),
                ));
            }
        }

        let before = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("user {user_id}")))?;

        let target = next_state(before.onboarding_status, &event).ok_or_else(|| {
            CoreError::Conflict(format!(
                "no transition for event {event:?} from {:?}",
                before.onboarding_status
            ))
        })?;

        let user = self
            .users
            .update(
                user_id,
                Box::new(move |u| {
                    u.onboarding_status = target;
                    Ok(())
                }),
            )
            .await?;

        self.audit
            .record(AuditEntryDraft {
                actor: actor.to_string(),
                action: "onboarding.transition".to_string(),
                resource_type: "user".to_string(),
                resource_id: user_id.to_string(),
                before: Some(json!({ "onboarding_status": before.onboarding_status.as_str() })),
                after: Some(json!({ "onboarding_status": target.as_str() })),
                status: "ok".to_string(),
                amount: None,
                currency: None,
                ip: None,
                ua: None,
                error: None,
            })
            .await?;

        self.enqueue_follow_on_jobs(user_id, target).await?;

        Ok(user)
    }

    async fn enqueue_follow_on_jobs(
        &self,
        user_id: Uuid,
        target: OnboardingStatus,
    ) -> Result<(), OnboardingError> {
        match target {
            OnboardingStatus::VerificationPending => {
                self.jobs
                    .enqueue(
                        "send_notification",
                        json!({ "user_id": user_id, "category": "verification_code" }),
                        Some(&format!("notify-verify-{user_id}")),
                        self.notification_max_attempts,
                    )
                    .await?;
            }
            OnboardingStatus::WalletsProvisioning => {
                self.jobs
                    .enqueue(
                        "wallet_provision",
                        json!({ "user_id": user_id }),
                        Some(&format!("wallet-provision-{user_id}")),
                        self.job_max_attempts,
                    )
                    .await?;
            }
            OnboardingStatus::Completed => {
                self.jobs
                    .enqueue(
                        "send_notification",
                        json!({ "user_id": user_id, "category": "onboarding_complete" }),
                        Some(&format!("notify-complete-{user_id}")),
                        self.notification_max_attempts,
                    )
                    .await?;
            }
            OnboardingStatus::Rejected => {
                self.jobs
                    .enqueue(
                        "send_notification",
                        json!({ "user_id": user_id, "category": "kyc_rejected" }),
                        Some(&format!("notify-rejected-{user_id}")),
                        self.notification_max_attempts,
                    )
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OnboardingStatus as S;

    #[test]
    fn transition_table_matches_the_diagram() {
        assert_eq!(next_state(S::Started, &OnboardingEvent::Signup), Some(S::VerificationPending));
        assert_eq!(
            next_state(S::VerificationPending, &OnboardingEvent::CodeVerified),
            Some(S::KycPending)
        );
        assert_eq!(
            next_state(S::KycPending, &OnboardingEvent::KycSubmitted),
            Some(S::KycProcessing)
        );
        assert_eq!(
            next_state(S::KycProcessing, &OnboardingEvent::KycApproved),
            Some(S::WalletsProvisioning)
        );
        assert_eq!(next_state(S::KycProcessing, &OnboardingEvent::KycRejected), Some(S::Rejected));
        assert_eq!(
            next_state(S::WalletsProvisioning, &OnboardingEvent::WalletsProvisioned),
            Some(S::Completed)
        );
    }

    #[test]
    fn illegal_transitions_return_none() {
        assert_eq!(next_state(S::Started, &OnboardingEvent::KycSubmitted), None);
        assert_eq!(next_state(S::Completed, &OnboardingEvent::Signup), None);
    }

    #[test]
    fn admin_override_bypasses_the_table() {
        assert_eq!(
            next_state(S::Completed, &OnboardingEvent::AdminOverride(S::KycPending)),
            Some(S::KycPending)
        );
    }

    #[tokio::test]
    async fn kyc_approval_requires_fresh_passcode_session() {
        let users = Arc::new(crate::users::MemoryUserStore::new());
        let jobs = Arc::new(crate::job_store::MemoryJobStore::new());
        let audit = Arc::new(crate::audit::MemoryAuditLog::new("secret"));
        let passcodes = Arc::new(crate::security::MemoryPasscodeStore::new(5, 15 * 60, 10 * 60));
        let machine = OnboardingMachine::new(users.clone(), jobs, audit, passcodes, 5, 5);

        let user = users
            .create(crate::users::NewUser {
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
                    u.onboarding_status = OnboardingStatus::KycProcessing;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let result = machine
            .transition(user.id, OnboardingEvent::KycApproved, "webhook:kyc")
            .await;
        assert!(matches!(result, Err(CoreError::Locked(_))));
    }

    #[tokio::test]
    async fn full_happy_path_reaches_completed() {
        let users = Arc::new(crate::users::MemoryUserStore::new());
        let jobs = Arc::new(crate::job_store::MemoryJobStore::new());
        let audit = Arc::new(crate::audit::MemoryAuditLog::new("secret"));
        let passcodes = Arc::new(crate::security::MemoryPasscodeStore::new(5, 15 * 60, 10 * 60));
        let machine = OnboardingMachine::new(users.clone(), jobs, audit, passcodes.clone(), 5, 5);

        let user = users
            .create(crate::users::NewUser {
                email: Some("a@x.com".into()),
                phone: None,
                password_hash: "hash".into(),
            })
            .await
            .unwrap();

        machine.transition(user.id, OnboardingEvent::Signup, "system").await.unwrap();
        machine
            .transition(user.id, OnboardingEvent::CodeVerified, "system")
            .await
            .unwrap();
        machine
            .transition(user.id, OnboardingEvent::KycSubmitted, "system")
            .await
            .unwrap();

        passcodes.set(user.id, "1234").await.unwrap();
        passcodes.verify(user.id, "1234").await.unwrap();

        let user = machine
            .transition(user.id, OnboardingEvent::KycApproved, "webhook:kyc")
            .await
            .unwrap();
        assert_eq!(user.onboarding_status, OnboardingStatus::WalletsProvisioning);

        let user = machine
            .transition(user.id, OnboardingEvent::WalletsProvisioned, "worker:wallet_provision")
            .await
            .unwrap();
        assert_eq!(user.onboarding_status, OnboardingStatus::Completed);
    }
}
