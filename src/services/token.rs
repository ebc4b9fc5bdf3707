//! Signed token issuance and verification.
//!
//! Issuer and verifiers share one HMAC key. The configured secret may be
//! base64 or raw text; both sides derive the same key bytes through
//! [`decode_secret`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use thiserror::Error;

use crate::models::auth::{AuthenticatedUser, Claims, IdentityClaims, TokenType};

const MIN_KEY_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token is malformed")]
    Malformed,

    #[error("Token signature is invalid")]
    SignatureInvalid,

    #[error("Token has expired")]
    Expired,

    #[error("Expected a {expected:?} token")]
    WrongType { expected: TokenType },

    #[error("Token configuration error: {0}")]
    Configuration(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                TokenError::SignatureInvalid
            }
            _ => TokenError::Malformed,
        }
    }
}

/// Base64 first, raw UTF-8 bytes otherwise.
pub fn decode_secret(secret: &str) -> Vec<u8> {
    let trimmed = secret.trim();
    match STANDARD.decode(trimmed) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => trimmed.as_bytes().to_vec(),
    }
}

#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn from_secret(secret: &str) -> Result<Self, TokenError> {
        if secret.trim().is_empty() {
            return Err(TokenError::Configuration(
                "JWT secret is not configured".into(),
            ));
        }
        Self::from_key_bytes(&decode_secret(secret))
    }

    /// HS512 for keys of 64+ bytes, HS384 for 48+, HS256 for 32+.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, TokenError> {
        let algorithm = match key.len() {
            n if n >= 64 => Algorithm::HS512,
            n if n >= 48 => Algorithm::HS384,
            n if n >= MIN_KEY_BYTES => Algorithm::HS256,
            n => {
                return Err(TokenError::Configuration(format!(
                    "JWT key is {n} bytes; at least {MIN_KEY_BYTES} are required"
                )))
            }
        };
        Ok(Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            algorithm,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn issue(&self, identity: &IdentityClaims, ttl: Duration) -> Result<String, TokenError> {
        self.issue_at(identity, ttl, Utc::now())
    }

    pub fn issue_at(
        &self,
        identity: &IdentityClaims,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = Claims {
            identity: identity.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| TokenError::Configuration(format!("jwt encode: {e}")))
    }

    /// Checks signature and expiry. No I/O.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = decode::<Claims>(token, &self.decoding, &validation)?.claims;
        if claims.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    pub fn verify_typed(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.identity.token_type != expected {
            return Err(TokenError::WrongType { expected });
        }
        Ok(claims)
    }

    pub fn verify_access(&self, token: &str) -> Result<AuthenticatedUser, TokenError> {
        let claims = self.verify_typed(token, TokenType::Access)?;
        authenticated_user(&claims)
    }
}

pub fn authenticated_user(claims: &Claims) -> Result<AuthenticatedUser, TokenError> {
    let identity = &claims.identity;
    let user_id = match identity.user_id {
        Some(id) => id,
        None => identity.sub.parse().map_err(|_| TokenError::Malformed)?,
    };
    Ok(AuthenticatedUser {
        user_id,
        email: identity.sub.clone(),
        role: identity.role.ok_or(TokenError::Malformed)?,
        email_verified: identity.email_verified.unwrap_or(false),
    })
}

/// Seconds until `exp`, floored at zero.
pub fn remaining_ttl(claims: &Claims) -> i64 {
    (claims.exp - Utc::now().timestamp()).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::UserRole;
    use uuid::Uuid;

    const SECRET: &str = "0123456789abcdef0123456789abcdef-test";

    fn identity() -> IdentityClaims {
        IdentityClaims {
            sub: "ana@example.com".into(),
            token_type: TokenType::Access,
            user_id: Some(Uuid::new_v4()),
            role: Some(UserRole::DeliveryDriver),
            email_verified: Some(false),
            jti: None,
        }
    }

    #[test]
    fn verify_returns_the_issued_claims() {
        let codec = TokenCodec::from_secret(SECRET).unwrap();
        let id = identity();
        let token = codec.issue(&id, Duration::minutes(15)).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = codec.verify(&token).unwrap();
        assert_eq!(claims.identity, id);
        assert_eq!(claims.exp - claims.iat, 15 * 60);
    }

    #[test]
    fn remaining_ttl_counts_down_to_zero() {
        let codec = TokenCodec::from_secret(SECRET).unwrap();
        let token = codec.issue(&identity(), Duration::minutes(15)).unwrap();
        let mut claims = codec.verify(&token).unwrap();
        let left = remaining_ttl(&claims);
        assert!(left > 14 * 60 && left <= 15 * 60);

        claims.exp = claims.iat - 1;
        assert_eq!(remaining_ttl(&claims), 0);
    }

    #[test]
    fn elapsed_ttl_is_expired() {
        let codec = TokenCodec::from_secret(SECRET).unwrap();
        let issued = Utc::now() - Duration::minutes(20);
        let token = codec
            .issue_at(&identity(), Duration::minutes(15), issued)
            .unwrap();
        assert!(matches!(codec.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn other_key_is_signature_invalid() {
        let issuer = TokenCodec::from_secret(SECRET).unwrap();
        let verifier = TokenCodec::from_secret("another-secret-that-is-32-bytes-long!!").unwrap();
        let token = issuer.issue(&identity(), Duration::minutes(5)).unwrap();
        assert!(matches!(
            verifier.verify(&token),
            Err(TokenError::SignatureInvalid)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let codec = TokenCodec::from_secret(SECRET).unwrap();
        assert!(matches!(codec.verify("not-a-jwt"), Err(TokenError::Malformed)));
        assert!(matches!(codec.verify("a.b.c"), Err(TokenError::Malformed)));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let codec = TokenCodec::from_secret(SECRET).unwrap();
        let token = codec.issue(&identity(), Duration::minutes(5)).unwrap();
        let mut elevated = identity();
        elevated.role = Some(UserRole::Admin);
        let other = codec.issue(&elevated, Duration::minutes(5)).unwrap();
        let forged_payload = other.split('.').nth(1).unwrap();

        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = forged_payload;
        let tampered = parts.join(".");
        assert!(matches!(
            codec.verify(&tampered),
            Err(TokenError::SignatureInvalid)
        ));
    }

    #[test]
    fn base64_and_raw_secrets_derive_the_same_key() {
        let raw = "a-raw-secret-value-that-is-long-enough";
        let encoded = STANDARD.encode(raw);
        assert_eq!(decode_secret(&encoded), raw.as_bytes());
        assert_eq!(decode_secret(raw), raw.as_bytes());

        let issuer = TokenCodec::from_secret(&encoded).unwrap();
        let verifier = TokenCodec::from_secret(raw).unwrap();
        let token = issuer.issue(&identity(), Duration::minutes(5)).unwrap();
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn algorithm_follows_key_length() {
        assert_eq!(
            TokenCodec::from_key_bytes(&[7u8; 32]).unwrap().algorithm(),
            Algorithm::HS256
        );
        assert_eq!(
            TokenCodec::from_key_bytes(&[7u8; 48]).unwrap().algorithm(),
            Algorithm::HS384
        );
        assert_eq!(
            TokenCodec::from_key_bytes(&[7u8; 64]).unwrap().algorithm(),
            Algorithm::HS512
        );
    }

    #[test]
    fn missing_or_weak_secret_is_a_configuration_error() {
        assert!(matches!(
            TokenCodec::from_secret("  "),
            Err(TokenError::Configuration(_))
        ));
        assert!(matches!(
            TokenCodec::from_key_bytes(b"short"),
            Err(TokenError::Configuration(_))
        ));
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let codec = TokenCodec::from_secret(SECRET).unwrap();
        let mut id = identity();
        id.token_type = TokenType::Refresh;
        let token = codec.issue(&id, Duration::days(1)).unwrap();
        assert!(matches!(
            codec.verify_access(&token),
            Err(TokenError::WrongType {
                expected: TokenType::Access
            })
        ));
    }

    #[test]
    fn access_token_yields_authenticated_user() {
        let codec = TokenCodec::from_secret(SECRET).unwrap();
        let id = identity();
        let token = codec.issue(&id, Duration::minutes(5)).unwrap();
        let user = codec.verify_access(&token).unwrap();
        assert_eq!(Some(user.user_id), id.user_id);
        assert_eq!(user.role, UserRole::DeliveryDriver);
        assert_eq!(user.email, "ana@example.com");
    }
}
