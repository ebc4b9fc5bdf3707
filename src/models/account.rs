use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Failed-login threshold and how long the resulting lock lasts.
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub lock_duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lock_duration: Duration::minutes(30),
        }
    }
}

/// Per-account authentication counters and lock state.
///
/// `locked` is advisory: an elapsed `locked_until` does not clear it. Access
/// decisions go through [`AccountSecurity::is_locked_at`], where the timestamp
/// is authoritative and a missing timestamp means a permanent lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSecurity {
    pub failed_attempts: u32,
    pub locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl AccountSecurity {
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.locked_until.map_or(true, |until| until > now)
    }

    pub fn is_permanently_locked(&self) -> bool {
        self.locked && self.locked_until.is_none()
    }

    /// Counts one failed attempt; arms the lock once the threshold is reached.
    /// Returns true when this failure is the one that locked the account.
    pub fn register_failure(&mut self, policy: &LockoutPolicy, now: DateTime<Utc>) -> bool {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        if self.failed_attempts >= policy.max_attempts {
            self.locked = true;
            self.locked_until = Some(now + policy.lock_duration);
            self.locked_at = Some(now);
            return true;
        }
        false
    }

    pub fn lock(&mut self, until: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.locked = true;
        self.locked_until = until;
        self.locked_at = Some(now);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AccountSecurityRow {
    pub id: Uuid,
    pub failed_login_attempts: i32,
    pub account_locked: bool,
    pub account_locked_until: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl From<AccountSecurityRow> for AccountSecurity {
    fn from(row: AccountSecurityRow) -> Self {
        Self {
            failed_attempts: row.failed_login_attempts.max(0) as u32,
            locked: row.account_locked,
            locked_until: row.account_locked_until,
            locked_at: row.locked_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedAccount {
    pub id: Uuid,
    #[serde(flatten)]
    pub security: AccountSecurity,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LockoutPolicy {
        LockoutPolicy {
            max_attempts: 3,
            lock_duration: Duration::minutes(30),
        }
    }

    #[test]
    fn locks_on_the_threshold_failure() {
        let now = Utc::now();
        let mut sec = AccountSecurity::default();
        assert!(!sec.register_failure(&policy(), now));
        assert!(!sec.register_failure(&policy(), now));
        assert!(sec.register_failure(&policy(), now));
        assert_eq!(sec.failed_attempts, 3);
        assert_eq!(sec.locked_until, Some(now + Duration::minutes(30)));
        assert_eq!(sec.locked_at, Some(now));
        assert!(sec.is_locked_at(now));
    }

    #[test]
    fn flag_with_future_timestamp_is_locked() {
        let now = Utc::now();
        let sec = AccountSecurity {
            failed_attempts: 5,
            locked: true,
            locked_until: Some(now + Duration::minutes(1)),
            locked_at: Some(now),
        };
        assert!(sec.is_locked_at(now));
    }

    #[test]
    fn flag_with_elapsed_timestamp_is_not_locked_but_flag_survives() {
        let now = Utc::now();
        let sec = AccountSecurity {
            failed_attempts: 5,
            locked: true,
            locked_until: Some(now - Duration::seconds(1)),
            locked_at: Some(now - Duration::minutes(31)),
        };
        assert!(!sec.is_locked_at(now));
        assert!(sec.locked);
    }

    #[test]
    fn missing_timestamp_means_permanent() {
        let now = Utc::now();
        let mut sec = AccountSecurity::default();
        sec.lock(None, now);
        assert!(sec.is_locked_at(now + Duration::days(3650)));
        assert!(sec.is_permanently_locked());
    }

    #[test]
    fn reset_clears_everything() {
        let now = Utc::now();
        let mut sec = AccountSecurity::default();
        for _ in 0..3 {
            sec.register_failure(&policy(), now);
        }
        sec.reset();
        assert_eq!(sec, AccountSecurity::default());
        assert!(!sec.is_locked_at(now));
    }
}
