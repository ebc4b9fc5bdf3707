use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::StoreError;
use crate::models::account::{AccountSecurity, LockedAccount, LockoutPolicy};
use crate::models::user::{NewPrincipal, Principal};

/// Principal lookup and profile-level mutations.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// `email` is expected lowercased.
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, StoreError>;
    async fn email_exists(&self, email: &str) -> Result<bool, StoreError>;
    /// Fails with [`StoreError::Duplicate`] when the email is already taken.
    async fn create(&self, new: NewPrincipal) -> Result<Principal, StoreError>;
    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError>;
    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Failed-login counters and lock state, one record per principal.
///
/// Every mutation is applied atomically per account so that concurrent login
/// attempts cannot lose increments.
#[async_trait]
pub trait AccountSecurityStore: Send + Sync {
    fn policy(&self) -> LockoutPolicy;

    async fn security(&self, id: Uuid) -> Result<AccountSecurity, StoreError>;

    /// Increments the counter and arms the lock when the threshold is reached.
    /// Returns the state after the update.
    async fn record_failure(&self, id: Uuid) -> Result<AccountSecurity, StoreError>;

    /// Resets counters and lock state and stamps the last-login time.
    async fn record_success(&self, id: Uuid) -> Result<(), StoreError>;

    /// `None` locks permanently.
    async fn lock(&self, id: Uuid, until: Option<DateTime<Utc>>) -> Result<(), StoreError>;

    /// Clears counters and lock state without touching the last-login time.
    async fn unlock(&self, id: Uuid) -> Result<(), StoreError>;

    /// Accounts whose lock flag is set, including ones whose lock has elapsed.
    async fn list_locked(&self) -> Result<Vec<LockedAccount>, StoreError>;

    async fn is_locked(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.security(id).await?.is_locked_at(Utc::now()))
    }
}
