use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::StoreError;
use crate::models::refresh_token::{NewRefreshToken, RefreshToken};

/// Hex SHA-256 of a token value; the only form in which values are stored.
pub fn hash_token_value(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Server-side record of issued refresh tokens.
///
/// Revocation is monotonic: once revoked, a record is never mutated again.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn save(&self, token: NewRefreshToken) -> Result<RefreshToken, StoreError>;

    async fn find_by_value(&self, value: &str) -> Result<Option<RefreshToken>, StoreError>;

    /// Returns false when the value is unknown or already revoked.
    async fn revoke(&self, value: &str) -> Result<bool, StoreError>;

    /// Revokes every live token of the principal; returns how many were revoked.
    async fn revoke_all(&self, user_id: Uuid) -> Result<u64, StoreError>;

    /// Stamps `used_at` on first use. Revoked tokens are left untouched.
    async fn mark_used(&self, token_id: Uuid) -> Result<(), StoreError>;

    /// Unrevoked, unexpired tokens of the principal, newest first.
    async fn list_active(&self, user_id: Uuid) -> Result<Vec<RefreshToken>, StoreError>;

    /// Deletes tokens expired before `expired_before` or revoked before
    /// `revoked_before`.
    async fn purge(
        &self,
        expired_before: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex_sha256() {
        let h = hash_token_value("abc");
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(hash_token_value("abd"), h);
    }
}
