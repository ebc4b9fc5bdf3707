pub mod accounts;
pub mod auth;
pub mod memory;
pub mod metrics;
pub mod password;
pub mod rate_limiter;
pub mod refresh_tokens;
pub mod token;

use thiserror::Error;

/// Failure of a backing store (Postgres, Redis or in-memory).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record already exists: {0}")]
    Duplicate(String),

    #[error("Record not found")]
    NotFound,

    #[error("Stored record is invalid: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
