use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::is_unique_violation;
use crate::models::refresh_token::{NewRefreshToken, RefreshToken};
use crate::services::refresh_tokens::{hash_token_value, RefreshTokenStore};
use crate::services::StoreError;

const TOKEN_COLUMNS: &str = "id, token_hash, user_id, expires_at, used_at, revoked, revoked_at, \
     device_info, ip_address, created_at";

#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn save(&self, token: NewRefreshToken) -> Result<RefreshToken, StoreError> {
        sqlx::query_as::<_, RefreshToken>(&format!(
            "INSERT INTO refresh_tokens (id, token_hash, user_id, expires_at, device_info, ip_address)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&token.token_hash)
        .bind(token.user_id)
        .bind(token.expires_at)
        .bind(&token.device_info)
        .bind(&token.ip_address)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate("refresh token".into())
            } else {
                StoreError::Database(e)
            }
        })
    }

    async fn find_by_value(&self, value: &str) -> Result<Option<RefreshToken>, StoreError> {
        let token = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = $1"
        ))
        .bind(hash_token_value(value))
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    async fn revoke(&self, value: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = NOW()
             WHERE token_hash = $1 AND revoked = FALSE",
        )
        .bind(hash_token_value(value))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = NOW()
             WHERE user_id = $1 AND revoked = FALSE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_used(&self, token_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET used_at = COALESCE(used_at, NOW())
             WHERE id = $1 AND revoked = FALSE",
        )
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM refresh_tokens WHERE id = $1)")
                    .bind(token_id)
                    .fetch_one(&self.pool)
                    .await?;
            if !exists {
                return Err(StoreError::NotFound);
            }
        }
        Ok(())
    }

    async fn list_active(&self, user_id: Uuid) -> Result<Vec<RefreshToken>, StoreError> {
        let tokens = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens
             WHERE user_id = $1 AND revoked = FALSE AND expires_at > NOW()
             ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }

    async fn purge(
        &self,
        expired_before: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM refresh_tokens
             WHERE expires_at < $1 OR (revoked AND revoked_at < $2)",
        )
        .bind(expired_before)
        .bind(revoked_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
