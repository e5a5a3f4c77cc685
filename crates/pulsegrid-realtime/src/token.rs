//! Bearer token verification
//!
//! Tokens are HS256 JWTs. Verification tries the primary secret first and the
//! refresh secret second. A token whose `type` claim is `refresh` is refused
//! no matter which secret signed it, and the claim is inspected before any
//! signature check so a malformed refresh token cannot slip through.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use pulsegrid_core::auth::{AuthRejection, RejectReason};
use pulsegrid_core::{TenantId, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Token type that is never accepted for socket authentication
pub const REFRESH_TOKEN_TYPE: &str = "refresh";

/// Claims carried by an access token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User ID
    pub sub: String,
    /// Tenant the user belongs to
    #[serde(alias = "organization_id", alias = "org_id")]
    pub tenant_id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: u64,
}

impl TokenClaims {
    /// Access-token claims valid for `ttl`
    pub fn access(user_id: UserId, tenant_id: TenantId, ttl: Duration) -> Self {
        let now = Utc::now().timestamp().max(0) as u64;
        Self {
            sub: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            token_type: Some("access".to_string()),
            exp: now + ttl.as_secs(),
            iat: now,
        }
    }

    pub fn is_refresh(&self) -> bool {
        self.token_type.as_deref() == Some(REFRESH_TOKEN_TYPE)
    }

    /// Sign with HS256
    pub fn sign(&self, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
        encode(
            &Header::new(Algorithm::HS256),
            self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }
}

/// Identity extracted from a verified token
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedToken {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub claims: TokenClaims,
}

/// Read the `type` claim without verifying the signature
pub fn peek_token_type(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

/// Verifies access tokens against the primary and refresh secrets
pub struct TokenVerifier {
    primary: DecodingKey,
    refresh: Option<DecodingKey>,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(primary_secret: &str, refresh_secret: Option<&str>) -> Self {
        Self {
            primary: DecodingKey::from_secret(primary_secret.as_bytes()),
            refresh: refresh_secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedToken, AuthRejection> {
        if peek_token_type(token).as_deref() == Some(REFRESH_TOKEN_TYPE) {
            return Err(invalid("refresh tokens are not accepted"));
        }

        let claims = match decode::<TokenClaims>(token, &self.primary, &self.validation) {
            Ok(data) => data.claims,
            Err(primary_err) => match &self.refresh {
                Some(key) => decode::<TokenClaims>(token, key, &self.validation)
                    .map(|data| data.claims)
                    .map_err(|e| invalid(format!("token verification failed: {}", e)))?,
                None => {
                    return Err(invalid(format!(
                        "token verification failed: {}",
                        primary_err
                    )));
                }
            },
        };

        if claims.is_refresh() {
            return Err(invalid("refresh tokens are not accepted"));
        }

        let user_id = Uuid::parse_str(&claims.sub)
            .map(UserId::from_uuid)
            .map_err(|_| invalid("subject is not a user id"))?;
        let tenant_id = TenantId::from_string(&claims.tenant_id)
            .map_err(|_| invalid("tenant claim is not a tenant id"))?;

        Ok(VerifiedToken {
            user_id,
            tenant_id,
            claims,
        })
    }
}

fn invalid(message: impl Into<String>) -> AuthRejection {
    AuthRejection::new(RejectReason::InvalidToken, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: &str = "primary-secret";
    const REFRESH: &str = "refresh-secret";

    fn claims() -> TokenClaims {
        TokenClaims::access(UserId::new(), TenantId::new(), Duration::from_secs(3600))
    }

    #[test]
    fn test_primary_secret_verifies() {
        let claims = claims();
        let token = claims.sign(PRIMARY).unwrap();
        let verified = TokenVerifier::new(PRIMARY, None).verify(&token).unwrap();
        assert_eq!(verified.user_id.to_string(), claims.sub);
        assert_eq!(verified.tenant_id.to_string(), claims.tenant_id);
    }

    #[test]
    fn test_refresh_secret_is_fallback() {
        let token = claims().sign(REFRESH).unwrap();
        assert!(TokenVerifier::new(PRIMARY, None).verify(&token).is_err());
        assert!(
            TokenVerifier::new(PRIMARY, Some(REFRESH))
                .verify(&token)
                .is_ok()
        );
    }

    #[test]
    fn test_refresh_type_always_rejected() {
        let mut claims = claims();
        claims.token_type = Some("refresh".to_string());
        let verifier = TokenVerifier::new(PRIMARY, Some(REFRESH));

        for secret in [PRIMARY, REFRESH, "unrelated"] {
            let token = claims.sign(secret).unwrap();
            let err = verifier.verify(&token).unwrap_err();
            assert_eq!(err.reason, RejectReason::InvalidToken);
            assert!(err.message.contains("refresh"));
        }
    }

    #[test]
    fn test_peek_token_type() {
        let mut claims = claims();
        claims.token_type = Some("refresh".to_string());
        let token = claims.sign("anything").unwrap();
        assert_eq!(peek_token_type(&token).as_deref(), Some("refresh"));
        assert_eq!(peek_token_type("not-a-jwt"), None);
        assert_eq!(peek_token_type("a.!!!.c"), None);
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut claims = claims();
        claims.exp = (Utc::now().timestamp() - 3600) as u64;
        let token = claims.sign(PRIMARY).unwrap();
        let err = TokenVerifier::new(PRIMARY, None).verify(&token).unwrap_err();
        assert_eq!(err.reason, RejectReason::InvalidToken);
    }

    #[test]
    fn test_bad_subject_rejected() {
        let mut claims = claims();
        claims.sub = "not-a-uuid".to_string();
        let token = claims.sign(PRIMARY).unwrap();
        assert!(TokenVerifier::new(PRIMARY, None).verify(&token).is_err());
    }

    #[test]
    fn test_org_id_alias_accepted() {
        let tenant = TenantId::new();
        let json = serde_json::json!({
            "sub": UserId::new().to_string(),
            "org_id": tenant.to_string(),
            "exp": (Utc::now().timestamp() + 60) as u64,
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json,
            &EncodingKey::from_secret(PRIMARY.as_bytes()),
        )
        .unwrap();
        let verified = TokenVerifier::new(PRIMARY, None).verify(&token).unwrap();
        assert_eq!(verified.tenant_id, tenant);
    }
}
