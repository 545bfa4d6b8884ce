use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{IdentityError, IdentityProvider};
use crate::storage::{prefixes, Storage};

/// Username/password identity provider
///
/// Stores a salted SHA-256 digest of each subject's password under the
/// `identity:` prefix.
#[derive(Clone)]
pub struct UserPasswordProvider {
    storage: Arc<dyn Storage>,
}

impl fmt::Debug for UserPasswordProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPasswordProvider").finish_non_exhaustive()
    }
}

impl UserPasswordProvider {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn digest(subject: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("user_password:{subject}:{password}").as_bytes());
        hex::encode(hasher.finalize())
    }

    fn storage_key(subject: &str) -> String {
        format!("{}{}", prefixes::IDENTITY, subject)
    }

    /// Register (or replace) the password for `subject`
    pub async fn register(&self, subject: &str, password: &str) -> Result<(), IdentityError> {
        self.storage
            .set(
                &Self::storage_key(subject),
                Self::digest(subject, password).as_bytes(),
            )
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for UserPasswordProvider {
    async fn verify(&self, subject: &str, secret: &str) -> Result<bool, IdentityError> {
        let stored = self
            .storage
            .get(&Self::storage_key(subject))
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        let Some(stored) = stored else {
            debug!(%subject, "no credential registered for subject");
            return Ok(false);
        };

        Ok(stored == Self::digest(subject, secret).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_verify_registered_subject() {
        let provider = UserPasswordProvider::new(Arc::new(MemoryStorage::new()));
        provider.register("user@example.com", "hunter2").await.unwrap();

        assert!(provider.verify("user@example.com", "hunter2").await.unwrap());
        assert!(!provider.verify("user@example.com", "hunter3").await.unwrap());
        assert!(!provider.verify("other@example.com", "hunter2").await.unwrap());
    }

    #[tokio::test]
    async fn test_digest_is_bound_to_subject() {
        assert_ne!(
            UserPasswordProvider::digest("a", "pw"),
            UserPasswordProvider::digest("b", "pw")
        );
    }
}
