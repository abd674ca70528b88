//! Identity resolution from bearer tokens.

use async_trait::async_trait;
use carevault_core::{Principal, Role};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity resolution errors.
#[derive(Debug, Clone, Error)]
pub enum IdentityError {
    /// Token has expired (exp claim is in the past).
    #[error("Token has expired")]
    TokenExpired,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Missing required claim: {0}")]
    MissingClaim(String),

    /// Key material is invalid or malformed.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Turns a request credential into a [`Principal`].
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a bearer token. Errors mean the credential was presented
    /// but is not acceptable.
    async fn resolve(&self, token: &str) -> Result<Principal, IdentityError>;
}

/// Claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub role: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Configuration for JWT validation.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Leeway in seconds for exp validation (clock skew tolerance).
    pub leeway: u64,
    pub issuer: Option<String>,
    pub audience: Option<Vec<String>>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            leeway: 60,
            issuer: None,
            audience: None,
        }
    }
}

impl ValidationConfig {
    #[must_use]
    pub fn with_leeway(mut self, leeway: u64) -> Self {
        self.leeway = leeway;
        self
    }

    #[must_use]
    pub fn issuer(mut self, iss: impl Into<String>) -> Self {
        self.issuer = Some(iss.into());
        self
    }

    #[must_use]
    pub fn audience(mut self, aud: Vec<impl Into<String>>) -> Self {
        self.audience = Some(aud.into_iter().map(Into::into).collect());
        self
    }
}

/// Validates signed JWTs with `sub` and `role` claims.
#[derive(Clone)]
pub struct JwtIdentityResolver {
    key: DecodingKey,
    algorithm: Algorithm,
    config: ValidationConfig,
}

impl JwtIdentityResolver {
    /// HS256 with a shared secret.
    pub fn hs256(secret: &[u8]) -> Result<Self, IdentityError> {
        if secret.is_empty() {
            return Err(IdentityError::InvalidKey("empty HS256 secret".into()));
        }
        Ok(Self {
            key: DecodingKey::from_secret(secret),
            algorithm: Algorithm::HS256,
            config: ValidationConfig::default(),
        })
    }

    /// RS256 with a PEM-encoded RSA public key.
    pub fn rs256_pem(public_key_pem: &[u8]) -> Result<Self, IdentityError> {
        let key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| IdentityError::InvalidKey(format!("Invalid public key: {e}")))?;
        Ok(Self {
            key,
            algorithm: Algorithm::RS256,
            config: ValidationConfig::default(),
        })
    }

    #[must_use]
    pub fn with_validation(mut self, config: ValidationConfig) -> Self {
        self.config = config;
        self
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = self.config.leeway;
        validation.algorithms = vec![self.algorithm];
        validation.set_required_spec_claims(&["exp", "sub"]);

        if let Some(ref iss) = self.config.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(ref aud) = self.config.audience {
            validation.set_audience(aud);
        } else {
            validation.validate_aud = false;
        }
        validation
    }

    /// Decode and validate a token, returning its claims.
    pub fn decode_claims(&self, token: &str) -> Result<AccessClaims, IdentityError> {
        decode::<AccessClaims>(token, &self.key, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => IdentityError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    IdentityError::InvalidSignature
                }
                jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(claim) => {
                    IdentityError::MissingClaim(claim.clone())
                }
                _ => IdentityError::InvalidToken(e.to_string()),
            })
    }
}

impl std::fmt::Debug for JwtIdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityResolver")
            .field("algorithm", &self.algorithm)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, token: &str) -> Result<Principal, IdentityError> {
        let claims = self.decode_claims(token)?;
        let role: Role = claims
            .role
            .parse()
            .map_err(|e: carevault_core::CoreError| IdentityError::InvalidToken(e.to_string()))?;
        // Rejects the reserved system id, so tokens can never carry it.
        Principal::new(claims.sub, role).map_err(|e| IdentityError::InvalidToken(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carevault_core::SYSTEM_PRINCIPAL_ID;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"unit-test-secret";

    fn token(sub: &str, role: &str, exp_offset: i64) -> String {
        let claims = AccessClaims {
            sub: sub.to_string(),
            role: role.to_string(),
            exp: Utc::now().timestamp() + exp_offset,
            iss: Some("carevault".into()),
            aud: None,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_valid_token() {
        let resolver = JwtIdentityResolver::hs256(SECRET).unwrap();
        let principal = resolver.resolve(&token("user-1", "admin", 600)).await.unwrap();
        assert_eq!(principal.id(), "user-1");
        assert_eq!(principal.role(), Role::Admin);
        assert!(!principal.is_system());
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let resolver = JwtIdentityResolver::hs256(SECRET).unwrap();
        let err = resolver
            .resolve(&token("user-1", "admin", -3600))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::TokenExpired));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let resolver = JwtIdentityResolver::hs256(b"another-secret").unwrap();
        let err = resolver
            .resolve(&token("user-1", "admin", 600))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidSignature));
    }

    #[tokio::test]
    async fn test_unknown_role_and_system_id_rejected() {
        let resolver = JwtIdentityResolver::hs256(SECRET).unwrap();
        assert!(resolver.resolve(&token("user-1", "root", 600)).await.is_err());
        assert!(resolver
            .resolve(&token(SYSTEM_PRINCIPAL_ID, "issuer", 600))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_issuer_checked_when_configured() {
        let resolver = JwtIdentityResolver::hs256(SECRET)
            .unwrap()
            .with_validation(ValidationConfig::default().issuer("someone-else"));
        assert!(resolver.resolve(&token("user-1", "issuer", 600)).await.is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            JwtIdentityResolver::hs256(b""),
            Err(IdentityError::InvalidKey(_))
        ));
    }
}
