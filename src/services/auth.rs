use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::accounts::{AccountSecurityStore, AccountStore};
use super::metrics::{LOCKOUTS_COUNTER, LOGINS_COUNTER, REFRESH_COUNTER, TOKENS_ISSUED_COUNTER};
use super::password::PasswordHasher;
use super::refresh_tokens::{hash_token_value, RefreshTokenStore};
use super::token::{TokenCodec, TokenError};
use super::StoreError;
use crate::models::account::LockedAccount;
use crate::models::auth::{IdentityClaims, TokenType};
use crate::models::refresh_token::{NewRefreshToken, RefreshToken};
use crate::models::user::{NewPrincipal, Principal, UserRole};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account is locked")]
    AccountLocked { until: Option<DateTime<Utc>> },

    #[error("Account is inactive")]
    AccountInactive,

    #[error("Email is already registered")]
    EmailTaken,

    #[error("Invalid token")]
    InvalidToken(#[source] TokenError),

    #[error("Refresh token not found")]
    TokenNotFound,

    #[error("Refresh token has been revoked")]
    TokenRevoked,

    #[error("Refresh token has expired")]
    TokenExpired,

    #[error("Current password is incorrect")]
    WrongPassword,

    #[error("{0}")]
    Validation(String),

    #[error("Account not found")]
    PrincipalNotFound,

    #[error("Token configuration error: {0}")]
    Configuration(String),

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct AuthSettings {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
        }
    }
}

/// Where a login came from; stored alongside the refresh token.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    pub principal: Principal,
}

pub struct AuthService {
    accounts: Arc<dyn AccountStore>,
    security: Arc<dyn AccountSecurityStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    codec: TokenCodec,
    hasher: Arc<dyn PasswordHasher>,
    settings: AuthSettings,
    // Verified against for unknown emails so both failure paths pay the hash cost.
    dummy_hash: OnceLock<Option<String>>,
}

impl AuthService {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        security: Arc<dyn AccountSecurityStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        codec: TokenCodec,
        hasher: Arc<dyn PasswordHasher>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            accounts,
            security,
            refresh_tokens,
            codec,
            hasher,
            settings,
            dummy_hash: OnceLock::new(),
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn settings(&self) -> AuthSettings {
        self.settings
    }

    /// Verifies credentials and issues an access/refresh pair.
    ///
    /// Lock and activation are checked before the password so that a locked
    /// account cannot be probed. Unknown emails and wrong passwords produce the
    /// same error.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client: ClientContext,
    ) -> Result<LoginOutcome, AuthError> {
        let email = normalize_email(email);
        let now = Utc::now();

        let Some(mut principal) = self.accounts.find_by_email(&email).await? else {
            self.burn_verify(password);
            LOGINS_COUNTER.with_label_values(&["invalid_credentials"]).inc();
            return Err(AuthError::InvalidCredentials);
        };

        let security = self.security.security(principal.id).await?;
        if security.is_locked_at(now) {
            LOGINS_COUNTER.with_label_values(&["locked"]).inc();
            warn!(user_id = %principal.id, "login rejected: account locked");
            return Err(AuthError::AccountLocked {
                until: security.locked_until,
            });
        }

        if !principal.active {
            LOGINS_COUNTER.with_label_values(&["inactive"]).inc();
            return Err(AuthError::AccountInactive);
        }

        if !self.hasher.verify(password, &principal.password_hash)? {
            self.record_failed_login(principal.id).await;
            LOGINS_COUNTER.with_label_values(&["invalid_credentials"]).inc();
            return Err(AuthError::InvalidCredentials);
        }

        self.security.record_success(principal.id).await?;
        principal.last_login_at = Some(now);

        let tokens = self.issue_pair(&principal, &client).await?;
        LOGINS_COUNTER.with_label_values(&["success"]).inc();
        info!(user_id = %principal.id, role = %principal.role, "login succeeded");

        Ok(LoginOutcome { tokens, principal })
    }

    fn burn_verify(&self, password: &str) {
        let dummy = self
            .dummy_hash
            .get_or_init(|| self.hasher.hash("unknown-account-placeholder").ok());
        if let Some(hash) = dummy {
            let _ = self.hasher.verify(password, hash);
        }
    }

    // Failures here must not mask the credential error, but they are
    // recorded before the caller sees it.
    async fn record_failed_login(&self, user_id: Uuid) {
        match self.security.record_failure(user_id).await {
            Ok(state) => {
                let policy = self.security.policy();
                if state.failed_attempts >= policy.max_attempts {
                    LOCKOUTS_COUNTER.inc();
                    warn!(
                        user_id = %user_id,
                        attempts = state.failed_attempts,
                        locked_until = ?state.locked_until,
                        "account locked after repeated failed logins"
                    );
                } else {
                    warn!(user_id = %user_id, attempts = state.failed_attempts, "failed login");
                }
            }
            Err(e) => error!(user_id = %user_id, "failed to record failed login: {}", e),
        }
    }

    async fn issue_pair(
        &self,
        principal: &Principal,
        client: &ClientContext,
    ) -> Result<TokenPair, AuthError> {
        let access_token = self.issue(&IdentityClaims::access_for(principal), self.settings.access_ttl)?;
        let refresh_token =
            self.issue(&IdentityClaims::refresh_for(principal), self.settings.refresh_ttl)?;

        self.refresh_tokens
            .save(NewRefreshToken {
                token_hash: hash_token_value(&refresh_token),
                user_id: principal.id,
                expires_at: Utc::now() + self.settings.refresh_ttl,
                device_info: client.device_info.clone(),
                ip_address: client.ip_address.clone(),
            })
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.settings.access_ttl.num_seconds(),
        })
    }

    fn issue(&self, identity: &IdentityClaims, ttl: Duration) -> Result<String, AuthError> {
        let token = self.codec.issue(identity, ttl).map_err(|e| match e {
            TokenError::Configuration(msg) => AuthError::Configuration(msg),
            other => AuthError::Configuration(other.to_string()),
        })?;
        let label = match identity.token_type {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        };
        TOKENS_ISSUED_COUNTER.with_label_values(&[label]).inc();
        Ok(token)
    }

    /// Creates a principal with the default role. No caller input can choose
    /// the role.
    pub async fn register(&self, registration: Registration) -> Result<Principal, AuthError> {
        let email = normalize_email(&registration.email);
        validate_email(&email)?;
        validate_password(&registration.password)?;

        if self.accounts.email_exists(&email).await? {
            return Err(AuthError::EmailTaken);
        }

        let password_hash = self.hasher.hash(&registration.password)?;
        let principal = self
            .accounts
            .create(NewPrincipal {
                email,
                password_hash,
                first_name: trimmed(registration.first_name),
                last_name: trimmed(registration.last_name),
                phone: trimmed(registration.phone),
                role: UserRole::default(),
            })
            .await
            .map_err(|e| match e {
                StoreError::Duplicate(_) => AuthError::EmailTaken,
                other => AuthError::Store(other),
            })?;

        info!(user_id = %principal.id, "registered new account");
        Ok(principal)
    }

    /// Issues a new access token. The refresh token is not rotated: the same
    /// value stays usable until it is revoked or expires.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let result = self.refresh_inner(refresh_token).await;
        let status = match &result {
            Ok(_) => "success",
            Err(AuthError::InvalidToken(_)) => "invalid",
            Err(AuthError::TokenNotFound) => "not_found",
            Err(AuthError::TokenRevoked) => "revoked",
            Err(AuthError::TokenExpired) => "expired",
            Err(_) => "error",
        };
        REFRESH_COUNTER.with_label_values(&[status]).inc();
        result
    }

    async fn refresh_inner(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        self.codec
            .verify_typed(refresh_token, TokenType::Refresh)
            .map_err(AuthError::InvalidToken)?;

        let stored = self
            .refresh_tokens
            .find_by_value(refresh_token)
            .await?
            .ok_or(AuthError::TokenNotFound)?;

        let now = Utc::now();
        if stored.revoked {
            warn!(user_id = %stored.user_id, token_id = %stored.id, "revoked refresh token presented");
            return Err(AuthError::TokenRevoked);
        }
        if stored.is_expired_at(now) {
            return Err(AuthError::TokenExpired);
        }

        let principal = self
            .accounts
            .find_by_id(stored.user_id)
            .await?
            .ok_or(AuthError::PrincipalNotFound)?;
        if !principal.active {
            return Err(AuthError::AccountInactive);
        }
        let security = self.security.security(principal.id).await?;
        if security.is_locked_at(now) {
            return Err(AuthError::AccountLocked {
                until: security.locked_until,
            });
        }

        let access_token = self.issue(&IdentityClaims::access_for(&principal), self.settings.access_ttl)?;
        self.refresh_tokens.mark_used(stored.id).await?;

        Ok(TokenPair {
            access_token,
            refresh_token: refresh_token.to_string(),
            expires_in: self.settings.access_ttl.num_seconds(),
        })
    }

    /// Revokes one refresh token. An absent value is a no-op.
    pub async fn logout(&self, refresh_token: Option<&str>) -> Result<(), AuthError> {
        let Some(value) = refresh_token.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(());
        };
        if self.refresh_tokens.revoke(value).await? {
            info!("refresh token revoked on logout");
        }
        Ok(())
    }

    pub async fn logout_all(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let revoked = self.refresh_tokens.revoke_all(user_id).await?;
        info!(user_id = %user_id, revoked, "revoked all refresh tokens");
        Ok(revoked)
    }

    /// Replaces the password hash and signs the principal out everywhere.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let principal = self.principal(user_id).await?;
        if !self.hasher.verify(current_password, &principal.password_hash)? {
            warn!(user_id = %user_id, "password change rejected: wrong current password");
            return Err(AuthError::WrongPassword);
        }
        validate_password(new_password)?;

        let new_hash = self.hasher.hash(new_password)?;
        self.accounts.update_password(user_id, &new_hash).await?;
        let revoked = self.refresh_tokens.revoke_all(user_id).await?;
        info!(user_id = %user_id, revoked, "password changed");
        Ok(())
    }

    pub async fn principal(&self, user_id: Uuid) -> Result<Principal, AuthError> {
        self.accounts
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::PrincipalNotFound)
    }

    pub async fn sessions(&self, user_id: Uuid) -> Result<Vec<RefreshToken>, AuthError> {
        Ok(self.refresh_tokens.list_active(user_id).await?)
    }

    // ── Administration ──────────────────────────────────────────────────────

    pub async fn unlock(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.principal(user_id).await?;
        self.security.unlock(user_id).await?;
        info!(user_id = %user_id, "account unlocked by administrator");
        Ok(())
    }

    pub async fn lock(&self, user_id: Uuid, until: Option<DateTime<Utc>>) -> Result<(), AuthError> {
        self.principal(user_id).await?;
        if until.is_some_and(|t| t <= Utc::now()) {
            return Err(AuthError::Validation("lockedUntil must be in the future".into()));
        }
        self.security.lock(user_id, until).await?;
        warn!(user_id = %user_id, locked_until = ?until, "account locked by administrator");
        Ok(())
    }

    /// Deactivation also revokes every refresh token of the principal.
    pub async fn set_active(&self, user_id: Uuid, active: bool) -> Result<(), AuthError> {
        self.accounts
            .set_active(user_id, active)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => AuthError::PrincipalNotFound,
                other => AuthError::Store(other),
            })?;
        if !active {
            self.refresh_tokens.revoke_all(user_id).await?;
        }
        info!(user_id = %user_id, active, "account activation changed");
        Ok(())
    }

    pub async fn locked_accounts(&self) -> Result<Vec<LockedAccount>, AuthError> {
        Ok(self.security.list_locked().await?)
    }

    /// Deletes refresh tokens that expired or were revoked more than
    /// `retention` ago.
    pub async fn purge_tokens(&self, retention: Duration) -> Result<u64, AuthError> {
        let cutoff = Utc::now() - retention;
        Ok(self.refresh_tokens.purge(cutoff, cutoff).await?)
    }

    pub async fn ping(&self) -> Result<(), AuthError> {
        Ok(self.accounts.ping().await?)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain.contains('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AuthError::Validation("A valid email address is required".into()))
    }
}

fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(validate_email("ana@example.com").is_ok());
        assert!(validate_email("ana@localhost").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("ana.example.com").is_err());
        assert!(validate_email("an a@example.com").is_err());
    }

    #[test]
    fn password_length_counts_characters() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("éééééééé").is_ok());
    }

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  Ana@Example.COM "), "ana@example.com");
    }
}
