use thiserror::Error;

pub mod auth;
pub mod config;
pub mod events;
pub mod policies;
pub mod providers;
pub mod secrets;
pub mod service;
pub mod storage;
pub mod utils;

pub use auth::token::{Issued, TokenManager};
pub use policies::{Page, PolicyAgent, PolicyError, PolicyReq, PolicyRes};
pub use service::{AuthService, Service};
pub use storage::models::{Key, KeyType};

/// Stable classification of failures, used by transport adapters to pick
/// response codes without inspecting error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request shape; never retried.
    Validation,
    /// Missing, invalid, expired or revoked credential.
    Authentication,
    /// Valid identity, denied permission.
    Authorization,
    /// The referenced entity does not exist (or is not visible to the caller).
    NotFound,
    /// Key store, signer, identity provider or permission engine failure.
    Backend,
}

/// Error that can occur during key issuance, identification and authorization
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid auth key type")]
    InvalidAuthKey,

    #[error("missing or malformed bearer token")]
    BearerToken,

    #[error("missing subject")]
    MissingSubject,

    #[error("missing entity id")]
    MissingId,

    #[error("missing member type")]
    MissingMemberType,

    #[error("requested expiry must be later than issuance")]
    InvalidExpiry,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    ExpiredToken,

    #[error("key type {expected} expected, got {actual}")]
    KeyTypeMismatch { expected: KeyType, actual: KeyType },

    #[error("key of type {0} cannot be used for this operation")]
    UnacceptedKeyType(KeyType),

    #[error("key has been revoked")]
    RevokedKey,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("invalid key configuration: {0}")]
    InvalidConfig(String),

    #[error("key store unavailable")]
    Storage(#[source] storage::StorageError),

    #[error("token signing failed")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error("identity provider unavailable")]
    Identity(#[source] providers::IdentityError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAuthKey
            | Self::BearerToken
            | Self::MissingSubject
            | Self::MissingId
            | Self::MissingMemberType
            | Self::InvalidExpiry => ErrorKind::Validation,
            Self::InvalidToken(_)
            | Self::ExpiredToken
            | Self::KeyTypeMismatch { .. }
            | Self::UnacceptedKeyType(_)
            | Self::RevokedKey
            | Self::AuthenticationFailed(_) => ErrorKind::Authentication,
            Self::AuthorizationFailed(_) => ErrorKind::Authorization,
            Self::KeyNotFound => ErrorKind::NotFound,
            Self::Storage(_) | Self::Signing(_) | Self::Identity(_) | Self::InvalidConfig(_) => {
                ErrorKind::Backend
            }
            Self::Policy(err) => err.kind(),
        }
    }
}
