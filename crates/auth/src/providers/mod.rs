use async_trait::async_trait;
use thiserror::Error;

pub mod user_password;

pub use user_password::UserPasswordProvider;

/// Error raised when the identity backend cannot answer
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity backend unavailable: {0}")]
    Unavailable(String),
}

/// Identity check used to authenticate a subject before a login key is minted
///
/// Only the login path consults it; every other key type is authorised by
/// the caller's own token.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Check `secret` against the credential held for `subject`.
    ///
    /// Returns `Ok(false)` for unknown subjects and wrong secrets alike.
    async fn verify(&self, subject: &str, secret: &str) -> Result<bool, IdentityError>;
}
