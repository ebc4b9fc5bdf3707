use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::is_unique_violation;
use crate::models::account::{AccountSecurity, AccountSecurityRow, LockedAccount, LockoutPolicy};
use crate::models::user::{NewPrincipal, Principal, PrincipalRow};
use crate::services::accounts::{AccountSecurityStore, AccountStore};
use crate::services::StoreError;

const PRINCIPAL_COLUMNS: &str = "id, email, password_hash, first_name, last_name, phone, role, \
     email_verified, active, last_login_at, created_at, updated_at";

const SECURITY_COLUMNS: &str =
    "id, failed_login_attempts, account_locked, account_locked_until, locked_at";

/// Principals and lockout state in the `users` table.
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
    policy: LockoutPolicy,
}

impl PgAccountStore {
    pub fn new(pool: PgPool, policy: LockoutPolicy) -> Self {
        Self { pool, policy }
    }
}

fn into_principal(row: PrincipalRow) -> Result<Principal, StoreError> {
    Principal::try_from(row).map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, StoreError> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.map(into_principal).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(into_principal).transpose()
    }

    async fn email_exists(&self, email: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn create(&self, new: NewPrincipal) -> Result<Principal, StoreError> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "INSERT INTO users (id, email, password_hash, first_name, last_name, phone, role)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {PRINCIPAL_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(&new.first_name)
        .bind(&new.last_name)
        .bind(&new.phone)
        .bind(new.role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(new.email.clone())
            } else {
                StoreError::Database(e)
            }
        })?;
        into_principal(row)
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AccountSecurityStore for PgAccountStore {
    fn policy(&self) -> LockoutPolicy {
        self.policy
    }

    async fn security(&self, id: Uuid) -> Result<AccountSecurity, StoreError> {
        let row = sqlx::query_as::<_, AccountSecurityRow>(&format!(
            "SELECT {SECURITY_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.into())
    }

    // One statement so concurrent failures cannot lose an increment; every
    // CASE sees the pre-update counter.
    async fn record_failure(&self, id: Uuid) -> Result<AccountSecurity, StoreError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, AccountSecurityRow>(&format!(
            "UPDATE users SET
                failed_login_attempts = failed_login_attempts + 1,
                account_locked = CASE WHEN failed_login_attempts + 1 >= $2 THEN TRUE ELSE account_locked END,
                account_locked_until = CASE WHEN failed_login_attempts + 1 >= $2 THEN $3 ELSE account_locked_until END,
                locked_at = CASE WHEN failed_login_attempts + 1 >= $2 THEN $4 ELSE locked_at END,
                updated_at = $4
             WHERE id = $1
             RETURNING {SECURITY_COLUMNS}"
        ))
        .bind(id)
        .bind(self.policy.max_attempts as i32)
        .bind(now + self.policy.lock_duration)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.into())
    }

    async fn record_success(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET
                failed_login_attempts = 0,
                account_locked = FALSE,
                account_locked_until = NULL,
                locked_at = NULL,
                last_login_at = NOW(),
                updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn lock(&self, id: Uuid, until: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET
                account_locked = TRUE,
                account_locked_until = $2,
                locked_at = NOW(),
                updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(until)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn unlock(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET
                failed_login_attempts = 0,
                account_locked = FALSE,
                account_locked_until = NULL,
                locked_at = NULL,
                updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_locked(&self) -> Result<Vec<LockedAccount>, StoreError> {
        let rows = sqlx::query_as::<_, AccountSecurityRow>(&format!(
            "SELECT {SECURITY_COLUMNS} FROM users WHERE account_locked ORDER BY locked_at DESC NULLS LAST"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| LockedAccount {
                id: row.id,
                security: row.into(),
            })
            .collect())
    }
}
