//! Authentication for the Starlight Hub.
//!
//! Registration carries an optional `authToken`. Per the data model, the
//! Hub compares it against a single configured shared secret
//! (`security.authToken`); this module additionally recognizes the token as
//! a JWT signed with that same secret, reusing the SDK-side [`JwtHandler`]
//! so a deployment can hand out short-lived signed tokens instead of a
//! static shared string without adding a second crate.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// JWT claims for Starlight authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(flatten)]
    pub extra: std::collections::HashMap<String, serde_json::Value>,
}

/// Generates and verifies JWTs signed with a shared secret.
#[derive(Clone)]
pub struct JwtHandler {
    secret: String,
    expires_in_seconds: i64,
}

impl JwtHandler {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            expires_in_seconds: 3600,
        }
    }

    pub fn with_expiry(mut self, seconds: i64) -> Self {
        self.expires_in_seconds = seconds;
        self
    }

    #[allow(clippy::result_large_err)]
    pub fn generate_token(&self, subject: impl Into<String>) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.expires_in_seconds);

        let claims = Claims {
            sub: subject.into(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: Some("starlight-hub".to_string()),
            extra: std::collections::HashMap::new(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;

        Ok(token)
    }

    #[allow(clippy::result_large_err)]
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.set_required_spec_claims(&["exp", "sub"]);

        let token_data: TokenData<Claims> = decode(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )?;

        Ok(token_data.claims)
    }
}

/// Validates a participant's registration `authToken` against the Hub's
/// configured shared secret.
///
/// Resolution order: exact match against the configured secret first (the
/// literal behavior spec.md describes), then — if that fails — attempt to
/// verify the token as a JWT signed with the same secret. Either success
/// accepts the registration.
pub struct AuthValidator {
    configured_secret: Option<String>,
    jwt: Option<JwtHandler>,
}

impl AuthValidator {
    pub fn new(configured_secret: Option<String>) -> Self {
        let jwt = configured_secret.clone().map(JwtHandler::new);
        Self {
            configured_secret,
            jwt,
        }
    }

    /// Whether auth is enabled at all (reported on `/health`).
    pub fn is_enabled(&self) -> bool {
        self.configured_secret.is_some()
    }

    /// Validate a presented token. Returns `true` when no secret is
    /// configured (auth disabled) or the token matches/verifies.
    pub fn validate(&self, presented: Option<&str>) -> bool {
        let Some(secret) = self.configured_secret.as_deref() else {
            return true;
        };

        match presented {
            Some(token) if constant_time_eq(token.as_bytes(), secret.as_bytes()) => true,
            Some(token) => self
                .jwt
                .as_ref()
                .map(|jwt| jwt.verify_token(token).is_ok())
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Compare two byte strings in time independent of where they first differ,
/// so a mismatched auth token can't be brute-forced via response timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
