use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::KeysConfig;
use crate::policies::{PolicyAgent, PolicyError, PolicyReq};
use crate::providers::IdentityProvider;
use crate::secrets::SigningKey;
use crate::storage::models::{Key, KeyType};
use crate::storage::{KeyStore, StorageError};
use crate::utils::{Clock, SystemClock};
use crate::AuthError;

pub mod jwt;
pub mod rules;

pub use jwt::KeyCodec;
pub use rules::{KeyRule, KeyRules};

/// Subject type and permission used to decide whether a caller may mint
/// keys on behalf of another subject.
const USER_TYPE: &str = "user";
const ADMIN_PERMISSION: &str = "admin";

/// Result of a successful issuance
///
/// `refresh` is only set for login, which always mints a session pair.
#[derive(Debug, Clone)]
pub struct Issued {
    pub key: Key,
    pub refresh: Option<Key>,
}

/// Key/token manager
///
/// Enforces the per-type trust rules, signs keys and validates presented
/// tokens. Revocable key types are checked against the key store on every
/// identification.
#[derive(Clone)]
pub struct TokenManager {
    codec: KeyCodec,
    rules: Arc<KeyRules>,
    store: Arc<dyn KeyStore>,
    identity: Arc<dyn IdentityProvider>,
    policies: PolicyAgent,
    clock: Arc<dyn Clock>,
    /// Serializes refresh rotation so a refresh key is exchanged at most once
    rotation: Arc<Mutex<()>>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("codec", &self.codec)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Create a new token manager
    ///
    /// # Arguments
    ///
    /// * `config` - Key issuance configuration
    /// * `signing_key` - Server-held signing key
    /// * `store` - Key store for revocable keys
    /// * `identity` - Credential check used by login
    /// * `policies` - Policy agent consulted for delegated issuance
    ///
    /// Fails when a configured key lifetime is out of range.
    pub fn new(
        config: &KeysConfig,
        signing_key: SigningKey,
        store: Arc<dyn KeyStore>,
        identity: Arc<dyn IdentityProvider>,
        policies: PolicyAgent,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            codec: KeyCodec::new(config.issuer.clone(), signing_key),
            rules: Arc::new(KeyRules::from_config(config)?),
            store,
            identity,
            policies,
            clock: Arc::new(SystemClock),
            rotation: Arc::new(Mutex::new(())),
        })
    }

    /// Replace the wall clock, mainly for expiry tests
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(0)
    }

    /// Issue a key
    ///
    /// Login requests carry the subject's credential in `key.secret` and need
    /// no caller token. API and recovery keys must be requested with a valid
    /// login key; an empty subject defaults to the caller.
    pub async fn issue(&self, caller_token: &str, key: Key) -> Result<Issued, AuthError> {
        let rule = *self.rules.rule(key.key_type);
        if !rule.issuable {
            return Err(AuthError::InvalidAuthKey);
        }

        if !rule.requires_caller {
            return self.login(&key.subject, &key.secret).await;
        }

        if caller_token.is_empty() {
            return Err(AuthError::BearerToken);
        }
        let caller = self.identify(caller_token, Some(KeyType::Login)).await?;

        let subject = if key.subject.is_empty() {
            caller.subject.clone()
        } else {
            key.subject.clone()
        };

        if subject != caller.subject {
            self.authorize_delegation(&caller.subject, &subject).await?;
        }

        let issued = self
            .mint(key.key_type, &caller.subject, &subject, key.expires_at)
            .await?;

        Ok(Issued {
            key: issued,
            refresh: None,
        })
    }

    /// Authenticate `subject` and mint a login/refresh pair
    pub async fn login(&self, subject: &str, credential: &str) -> Result<Issued, AuthError> {
        if subject.is_empty() {
            return Err(AuthError::MissingSubject);
        }

        let valid = self
            .identity
            .verify(subject, credential)
            .await
            .map_err(AuthError::Identity)?;

        if !valid {
            warn!(%subject, "login rejected");
            return Err(AuthError::AuthenticationFailed(
                "invalid credentials".to_owned(),
            ));
        }

        self.session(subject).await
    }

    /// Exchange a refresh key for a fresh pair, revoking the presented one
    ///
    /// Rotation is serialized within this manager and its clones. Managers in
    /// separate processes sharing one key store are not coordinated.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Issued, AuthError> {
        let _rotation = self.rotation.lock().await;
        let key = self.identify(refresh_token, Some(KeyType::Refresh)).await?;

        self.store
            .revoke(&key.id)
            .await
            .map_err(AuthError::Storage)?;

        debug!(key_id = %key.id, subject = %key.subject, "refresh key rotated");
        self.session(&key.subject).await
    }

    /// Validate `token` and return the key it encodes
    ///
    /// The key is valid up to and including its expiry second.
    pub async fn identify(
        &self,
        token: &str,
        expected: Option<KeyType>,
    ) -> Result<Key, AuthError> {
        if token.is_empty() {
            return Err(AuthError::BearerToken);
        }

        let key = self.codec.decode(token)?;

        if let Some(expected) = expected {
            if key.key_type != expected {
                return Err(AuthError::KeyTypeMismatch {
                    expected,
                    actual: key.key_type,
                });
            }
        }

        if key.is_expired(self.now()) {
            return Err(AuthError::ExpiredToken);
        }

        if self.rules.rule(key.key_type).persisted {
            match self.store.retrieve(&key.id).await {
                Ok(record) if record.is_revoked() => return Err(AuthError::RevokedKey),
                Ok(_) => {}
                Err(StorageError::NotFound) => return Err(AuthError::RevokedKey),
                Err(err) => return Err(AuthError::Storage(err)),
            }
        }

        Ok(key)
    }

    /// Revoke a key the caller issued
    ///
    /// Returns whether the key was revoked by this call. Unknown keys, keys
    /// that are already revoked and keys issued by someone else all succeed
    /// without effect.
    pub async fn revoke(&self, token: &str, key_id: &str) -> Result<bool, AuthError> {
        if key_id.is_empty() {
            return Err(AuthError::MissingId);
        }

        let caller = self.identify(token, Some(KeyType::Login)).await?;

        let record = match self.store.retrieve(key_id).await {
            Ok(record) => record,
            Err(StorageError::NotFound) => {
                debug!(%key_id, "revoking unknown key");
                return Ok(false);
            }
            Err(err) => return Err(AuthError::Storage(err)),
        };

        if record.key.issuer_id != caller.subject {
            debug!(%key_id, caller = %caller.subject, "key not issued by caller, ignoring revoke");
            return Ok(false);
        }

        if record.is_revoked() {
            return Ok(false);
        }

        self.store
            .revoke(key_id)
            .await
            .map_err(AuthError::Storage)?;

        info!(%key_id, key_type = %record.key.key_type, "key revoked");
        Ok(true)
    }

    /// Read back the metadata of a key the caller issued
    pub async fn retrieve_key(&self, token: &str, key_id: &str) -> Result<Key, AuthError> {
        if key_id.is_empty() {
            return Err(AuthError::MissingId);
        }

        let caller = self.identify(token, Some(KeyType::Login)).await?;

        match self.store.retrieve(key_id).await {
            Ok(record) if record.key.issuer_id == caller.subject => Ok(record.key),
            Ok(_) | Err(StorageError::NotFound) => Err(AuthError::KeyNotFound),
            Err(err) => Err(AuthError::Storage(err)),
        }
    }

    async fn authorize_delegation(&self, caller: &str, subject: &str) -> Result<(), AuthError> {
        let req = PolicyReq {
            subject_type: USER_TYPE.to_owned(),
            subject: caller.to_owned(),
            permission: ADMIN_PERMISSION.to_owned(),
            object_type: USER_TYPE.to_owned(),
            object: subject.to_owned(),
            ..PolicyReq::default()
        };

        match self.policies.check_policy(&req).await {
            Ok(()) => Ok(()),
            Err(PolicyError::Denied { reason }) => {
                warn!(%caller, %subject, %reason, "delegated issuance denied");
                Err(AuthError::AuthorizationFailed(format!(
                    "{caller} cannot issue keys for {subject}"
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn session(&self, subject: &str) -> Result<Issued, AuthError> {
        let key = self.mint(KeyType::Login, subject, subject, None).await?;
        let refresh = self.mint(KeyType::Refresh, subject, subject, None).await?;

        Ok(Issued {
            key,
            refresh: Some(refresh),
        })
    }

    async fn mint(
        &self,
        key_type: KeyType,
        issuer_id: &str,
        subject: &str,
        requested: Option<DateTime<Utc>>,
    ) -> Result<Key, AuthError> {
        let rule = self.rules.rule(key_type);
        let issued_at = self.now();
        let expires_at = rule.expiry(issued_at, requested)?;

        let id = match key_type {
            KeyType::Login => String::new(),
            _ => Uuid::new_v4().to_string(),
        };

        let mut key = Key {
            id,
            key_type,
            issuer_id: issuer_id.to_owned(),
            subject: subject.to_owned(),
            issued_at,
            expires_at,
            secret: String::new(),
        };
        key.secret = self.codec.encode(&key)?;

        if rule.persisted {
            self.store.save(&key).await.map_err(AuthError::Storage)?;
        }

        debug!(key_id = %key.id, %key_type, %subject, "key issued");
        Ok(key)
    }
}
