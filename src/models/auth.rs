use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::user::{Principal, UserRole};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Identity facts carried by a token, independent of its timing claims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityClaims {
    pub sub: String, // principal email
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<UserRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>, // refresh tokens only
}

impl IdentityClaims {
    pub fn access_for(principal: &Principal) -> Self {
        Self {
            sub: principal.email.clone(),
            token_type: TokenType::Access,
            user_id: Some(principal.id),
            role: Some(principal.role),
            email_verified: Some(principal.email_verified),
            jti: None,
        }
    }

    pub fn refresh_for(principal: &Principal) -> Self {
        Self {
            sub: principal.email.clone(),
            token_type: TokenType::Refresh,
            user_id: Some(principal.id),
            role: None,
            email_verified: None,
            jti: Some(Uuid::new_v4().to_string()),
        }
    }
}

/// Full JWT payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    #[serde(flatten)]
    pub identity: IdentityClaims,
    pub iat: i64,
    pub exp: i64,
}

/// Extracted from a validated access token, available through the axum extractors
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub email_verified: bool,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_issuer_contract() {
        let claims = Claims {
            identity: IdentityClaims {
                sub: "ana@example.com".into(),
                token_type: TokenType::Access,
                user_id: Some(Uuid::nil()),
                role: Some(UserRole::RestaurantOwner),
                email_verified: Some(true),
                jti: None,
            },
            iat: 10,
            exp: 20,
        };
        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["type"], "ACCESS");
        assert_eq!(value["role"], "RESTAURANT_OWNER");
        assert_eq!(value["emailVerified"], true);
        assert_eq!(value["userId"], Uuid::nil().to_string());
        assert!(value.get("jti").is_none());
        assert_eq!(value["exp"], 20);
    }
}
