use thiserror::Error;

/// Why a credential was refused or could not be produced.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Unknown user or wrong password; the two are not distinguished.
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("failed to issue token: {0}")]
    Issue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(AuthError::MissingToken.to_string(), "missing token");
        assert_eq!(AuthError::Expired.to_string(), "token expired");
        assert_eq!(
            AuthError::InvalidToken("bad signature".into()).to_string(),
            "invalid token: bad signature"
        );
    }
}
