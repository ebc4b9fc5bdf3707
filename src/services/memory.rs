//! In-process stores backed by `DashMap`. Used by the test-suite and by
//! single-instance deployments that run without Postgres.
//!
//! Per-account atomicity comes from the map's shard lock: every mutation runs
//! under a single `get_mut` guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use uuid::Uuid;

use super::accounts::{AccountSecurityStore, AccountStore};
use super::refresh_tokens::{hash_token_value, RefreshTokenStore};
use super::StoreError;
use crate::models::account::{AccountSecurity, LockedAccount, LockoutPolicy};
use crate::models::refresh_token::{NewRefreshToken, RefreshToken};
use crate::models::user::{NewPrincipal, Principal};

struct AccountEntry {
    principal: Principal,
    security: AccountSecurity,
}

pub struct InMemoryAccountStore {
    accounts: DashMap<Uuid, AccountEntry>,
    emails: DashMap<String, Uuid>,
    policy: LockoutPolicy,
}

impl InMemoryAccountStore {
    pub fn new(policy: LockoutPolicy) -> Self {
        Self {
            accounts: DashMap::new(),
            emails: DashMap::new(),
            policy,
        }
    }
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new(LockoutPolicy::default())
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, StoreError> {
        let Some(id) = self.emails.get(email).map(|r| *r.value()) else {
            return Ok(None);
        };
        self.find_by_id(id).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        Ok(self.accounts.get(&id).map(|e| e.principal.clone()))
    }

    async fn email_exists(&self, email: &str) -> Result<bool, StoreError> {
        Ok(self.emails.contains_key(email))
    }

    async fn create(&self, new: NewPrincipal) -> Result<Principal, StoreError> {
        match self.emails.entry(new.email.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(new.email)),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let principal = Principal {
                    id: Uuid::new_v4(),
                    email: new.email,
                    password_hash: new.password_hash,
                    first_name: new.first_name,
                    last_name: new.last_name,
                    phone: new.phone,
                    role: new.role,
                    email_verified: false,
                    active: true,
                    last_login_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.accounts.insert(
                    principal.id,
                    AccountEntry {
                        principal: principal.clone(),
                        security: AccountSecurity::default(),
                    },
                );
                slot.insert(principal.id);
                Ok(principal)
            }
        }
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        let mut entry = self.accounts.get_mut(&id).ok_or(StoreError::NotFound)?;
        entry.principal.password_hash = password_hash.to_string();
        entry.principal.updated_at = Utc::now();
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let mut entry = self.accounts.get_mut(&id).ok_or(StoreError::NotFound)?;
        entry.principal.active = active;
        entry.principal.updated_at = Utc::now();
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl AccountSecurityStore for InMemoryAccountStore {
    fn policy(&self) -> LockoutPolicy {
        self.policy
    }

    async fn security(&self, id: Uuid) -> Result<AccountSecurity, StoreError> {
        self.accounts
            .get(&id)
            .map(|e| e.security.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn record_failure(&self, id: Uuid) -> Result<AccountSecurity, StoreError> {
        let mut entry = self.accounts.get_mut(&id).ok_or(StoreError::NotFound)?;
        entry.security.register_failure(&self.policy, Utc::now());
        Ok(entry.security.clone())
    }

    async fn record_success(&self, id: Uuid) -> Result<(), StoreError> {
        let mut entry = self.accounts.get_mut(&id).ok_or(StoreError::NotFound)?;
        entry.security.reset();
        entry.principal.last_login_at = Some(Utc::now());
        Ok(())
    }

    async fn lock(&self, id: Uuid, until: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let mut entry = self.accounts.get_mut(&id).ok_or(StoreError::NotFound)?;
        entry.security.lock(until, Utc::now());
        Ok(())
    }

    async fn unlock(&self, id: Uuid) -> Result<(), StoreError> {
        let mut entry = self.accounts.get_mut(&id).ok_or(StoreError::NotFound)?;
        entry.security.reset();
        Ok(())
    }

    async fn list_locked(&self) -> Result<Vec<LockedAccount>, StoreError> {
        let mut locked: Vec<LockedAccount> = self
            .accounts
            .iter()
            .filter(|e| e.security.locked)
            .map(|e| LockedAccount {
                id: *e.key(),
                security: e.security.clone(),
            })
            .collect();
        locked.sort_by(|a, b| b.security.locked_at.cmp(&a.security.locked_at));
        Ok(locked)
    }
}

#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    tokens: DashMap<String, RefreshToken>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn save(&self, token: NewRefreshToken) -> Result<RefreshToken, StoreError> {
        match self.tokens.entry(token.token_hash.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate("refresh token".into())),
            Entry::Vacant(slot) => {
                let stored = RefreshToken {
                    id: Uuid::new_v4(),
                    token_hash: token.token_hash,
                    user_id: token.user_id,
                    expires_at: token.expires_at,
                    used_at: None,
                    revoked: false,
                    revoked_at: None,
                    device_info: token.device_info,
                    ip_address: token.ip_address,
                    created_at: Utc::now(),
                };
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn find_by_value(&self, value: &str) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self
            .tokens
            .get(&hash_token_value(value))
            .map(|t| t.value().clone()))
    }

    async fn revoke(&self, value: &str) -> Result<bool, StoreError> {
        let Some(mut token) = self.tokens.get_mut(&hash_token_value(value)) else {
            return Ok(false);
        };
        if token.revoked {
            return Ok(false);
        }
        token.revoked = true;
        token.revoked_at = Some(Utc::now());
        Ok(true)
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut count = 0;
        for mut token in self.tokens.iter_mut() {
            if token.user_id == user_id && !token.revoked {
                token.revoked = true;
                token.revoked_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn mark_used(&self, token_id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        for mut token in self.tokens.iter_mut() {
            if token.id == token_id {
                if !token.revoked && token.used_at.is_none() {
                    token.used_at = Some(now);
                }
                return Ok(());
            }
        }
        Err(StoreError::NotFound)
    }

    async fn list_active(&self, user_id: Uuid) -> Result<Vec<RefreshToken>, StoreError> {
        let now = Utc::now();
        let mut active: Vec<RefreshToken> = self
            .tokens
            .iter()
            .filter(|t| t.user_id == user_id && t.is_valid_at(now))
            .map(|t| t.value().clone())
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn purge(
        &self,
        expired_before: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let before = self.tokens.len();
        self.tokens.retain(|_, t| {
            let expired = t.expires_at < expired_before;
            let revoked = t.revoked && t.revoked_at.is_some_and(|at| at < revoked_before);
            !(expired || revoked)
        });
        Ok((before - self.tokens.len()) as u64)
    }
}
