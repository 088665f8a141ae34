use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{domain::UserId, error::CoreError};

const ISSUER: &str = "coordination-server";

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
}

/// Mints a signed session token for `identity`. The token is the credential
/// later presented at channel bind time.
pub fn mint_token(config: &AuthConfig, identity: &UserId) -> anyhow::Result<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        iss: ISSUER.to_string(),
        sub: identity.to_string(),
        iat: now,
        exp: now + config.ttl_seconds,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )?;
    Ok(token)
}

/// Resolves a presented token back to its identity. Expiry and signature are
/// both enforced; any failure refuses the bind.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::default();
        validation.set_issuer(&[ISSUER]);
        Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl registry::IdentityVerifier for TokenVerifier {
    async fn verify(&self, credential: &str) -> Result<UserId, CoreError> {
        let data = decode::<Claims>(credential, &self.decoding_key, &self.validation)
            .map_err(|err| CoreError::Authentication(err.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(CoreError::Authentication("empty subject".to_string()));
        }
        Ok(UserId::from(data.claims.sub.as_str()))
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
