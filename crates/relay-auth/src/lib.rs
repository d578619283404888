//! Token validation for the relay.
//!
//! The server only depends on [`TokenValidator`]; [`JwtAuthority`] is the
//! HS256 implementation used in production and tests. Account passwords
//! are hashed with bcrypt through [`PasswordHasher`].

pub mod errors;
pub mod jwt;
pub mod password;

pub use errors::AuthError;
pub use jwt::{Claims, JwtAuthority};
pub use password::PasswordHasher;

use relay_core::UserId;

/// Who a validated token belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Resolves an opaque bearer credential to an [`Identity`].
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Extract the token from an `Authorization` header value.
///
/// The `Bearer ` scheme is optional; surrounding whitespace is ignored.
pub fn bearer_token(header: &str) -> Option<&str> {
    let trimmed = header.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed)
        .trim();
    (!token.is_empty()).then_some(token)
}
