use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of key
///
/// Each variant carries a different trust level; the issuance rules for each
/// live in [`crate::auth::token::rules`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Session key minted at login, stateless and expiry-only
    Login,
    /// Paired with a login key, exchanged for a fresh pair
    Refresh,
    /// Long-lived, machine-scoped key
    Api,
    /// Single-purpose key with a short fixed lifetime
    Recovery,
}

impl KeyType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Refresh => "refresh",
            Self::Api => "api",
            Self::Recovery => "recovery",
        }
    }

    /// Whether the key may be presented to authenticate ordinary requests
    pub const fn grants_access(self) -> bool {
        matches!(self, Self::Login | Self::Api)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential record
///
/// `secret` is only populated on issuance responses (and, for login keys,
/// carries the subject's credential on the way in). It is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "type")]
    pub key_type: KeyType,

    #[serde(default)]
    pub issuer_id: String,

    pub subject: String,

    pub issued_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub secret: String,
}

impl Key {
    /// Create an issuance request for `subject`
    pub fn new(key_type: KeyType, subject: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            key_type,
            issuer_id: String::new(),
            subject: subject.into(),
            issued_at: Utc::now(),
            expires_at: None,
            secret: String::new(),
        }
    }

    /// Request a specific expiry (honoured for API keys only)
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Attach the subject's credential to a login request
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// A key is expired strictly after its expiry instant; at exactly
    /// `expires_at` it is still valid.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }
}

/// Persisted form of a key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    #[serde(flatten)]
    pub key: Key,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub const fn new(key: Key) -> Self {
        Self {
            key,
            revoked_at: None,
        }
    }

    pub const fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn revoke(&mut self) {
        if self.revoked_at.is_none() {
            self.revoked_at = Some(Utc::now());
        }
    }
}
