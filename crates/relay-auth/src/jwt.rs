use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use relay_core::UserId;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::AuthError;
use crate::{Identity, TokenValidator};

/// JWT payload. `user_id` accepts integer or string on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 signer and validator sharing one secret.
pub struct JwtAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl JwtAuthority {
    pub fn new(secret: &SecretString, ttl_hours: u32) -> Self {
        let raw = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            encoding: EncodingKey::from_secret(raw),
            decoding: DecodingKey::from_secret(raw),
            validation,
            ttl_secs: i64::from(ttl_hours) * 3600,
        }
    }

    /// Sign a token for `identity` valid for the configured lifetime.
    pub fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        self.issue_at(identity, Utc::now().timestamp())
    }

    /// Sign a token as if issued at unix time `now`.
    pub fn issue_at(&self, identity: &Identity, now: i64) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Issue(e.to_string()))
    }

    /// Re-sign a still-valid token with a fresh expiry.
    pub fn refresh(&self, token: &str) -> Result<String, AuthError> {
        let identity = self.validate(token)?;
        self.issue(&identity)
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            })
    }
}

impl TokenValidator for JwtAuthority {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let claims = self.decode_claims(token)?;
        debug!(user_id = %claims.user_id, "token validated");
        Ok(Identity {
            user_id: claims.user_id,
            username: claims.username,
        })
    }
}
