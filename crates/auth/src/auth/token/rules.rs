use chrono::{DateTime, Duration, Utc};

use crate::config::KeysConfig;
use crate::storage::models::KeyType;
use crate::AuthError;

/// Issuance rule for a single key type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRule {
    /// Whether `issue` accepts a request for this type directly
    pub issuable: bool,
    /// Whether issuance needs an authenticated caller
    pub requires_caller: bool,
    /// Lifetime applied when the caller does not pick one. `None` never expires.
    pub default_ttl: Option<Duration>,
    /// Whether the caller may pick the expiry
    pub overridable: bool,
    /// Upper bound on a caller-picked lifetime
    pub max_ttl: Option<Duration>,
    /// Whether the key is recorded in the key store and can be revoked
    pub persisted: bool,
}

impl KeyRule {
    /// Compute the expiry of a key issued at `issued_at`
    ///
    /// A caller-requested expiry is only honoured for overridable types and
    /// is clamped to `max_ttl`. It must lie strictly after `issued_at`.
    pub fn expiry(
        &self,
        issued_at: DateTime<Utc>,
        requested: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, AuthError> {
        // A ceiling past the calendar bound does not clamp.
        let ceiling = self
            .max_ttl
            .and_then(|ttl| issued_at.checked_add_signed(ttl));

        if let (true, Some(requested)) = (self.overridable, requested) {
            if requested <= issued_at {
                return Err(AuthError::InvalidExpiry);
            }
            return Ok(Some(match ceiling {
                Some(ceiling) if requested > ceiling => ceiling,
                _ => requested,
            }));
        }

        self.default_ttl
            .map(|ttl| {
                issued_at.checked_add_signed(ttl).ok_or_else(|| {
                    AuthError::InvalidConfig(format!(
                        "lifetime of {}s overflows the expiry of a key issued at {issued_at}",
                        ttl.num_seconds()
                    ))
                })
            })
            .transpose()
    }
}

/// Dispatch table from key type to its issuance rule
#[derive(Debug, Clone)]
pub struct KeyRules {
    login: KeyRule,
    refresh: KeyRule,
    api: KeyRule,
    recovery: KeyRule,
}

impl KeyRules {
    /// Build the table, rejecting lifetimes that cannot be represented
    pub fn from_config(config: &KeysConfig) -> Result<Self, AuthError> {
        let seconds = |name: &str, secs: u64| {
            i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .ok_or_else(|| AuthError::InvalidConfig(format!("{name} of {secs}s is out of range")))
        };

        Ok(Self {
            login: KeyRule {
                issuable: true,
                requires_caller: false,
                default_ttl: Some(seconds("login_duration", config.login_duration)?),
                overridable: false,
                max_ttl: None,
                persisted: false,
            },
            refresh: KeyRule {
                issuable: false,
                requires_caller: false,
                default_ttl: Some(seconds("refresh_duration", config.refresh_duration)?),
                overridable: false,
                max_ttl: None,
                persisted: true,
            },
            api: KeyRule {
                issuable: true,
                requires_caller: true,
                default_ttl: None,
                overridable: true,
                max_ttl: config
                    .api_key_max_duration
                    .map(|secs| seconds("api_key_max_duration", secs))
                    .transpose()?,
                persisted: true,
            },
            recovery: KeyRule {
                issuable: true,
                requires_caller: true,
                default_ttl: Some(seconds("recovery_duration", config.recovery_duration)?),
                overridable: false,
                max_ttl: None,
                persisted: false,
            },
        })
    }

    pub const fn rule(&self, key_type: KeyType) -> &KeyRule {
        match key_type {
            KeyType::Login => &self.login,
            KeyType::Refresh => &self.refresh,
            KeyType::Api => &self.api,
            KeyType::Recovery => &self.recovery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(api_max: Option<u64>) -> KeyRules {
        KeyRules::from_config(&KeysConfig {
            api_key_max_duration: api_max,
            ..KeysConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_recovery_ignores_requested_expiry() {
        let rules = rules(None);
        let now = Utc::now();

        let expiry = rules
            .rule(KeyType::Recovery)
            .expiry(now, Some(now + Duration::days(30)))
            .unwrap();

        assert_eq!(expiry, Some(now + Duration::seconds(300)));
    }

    #[test]
    fn test_api_key_expiry() {
        let now = Utc::now();

        assert_eq!(rules(None).rule(KeyType::Api).expiry(now, None).unwrap(), None);
        assert_eq!(
            rules(None)
                .rule(KeyType::Api)
                .expiry(now, Some(now + Duration::hours(1)))
                .unwrap(),
            Some(now + Duration::hours(1))
        );
        assert_eq!(
            rules(Some(60))
                .rule(KeyType::Api)
                .expiry(now, Some(now + Duration::hours(1)))
                .unwrap(),
            Some(now + Duration::seconds(60))
        );
        assert!(matches!(
            rules(None).rule(KeyType::Api).expiry(now, Some(now)),
            Err(AuthError::InvalidExpiry)
        ));
    }

    #[test]
    fn test_trust_requirements() {
        let rules = rules(None);

        assert!(!rules.rule(KeyType::Login).requires_caller);
        assert!(rules.rule(KeyType::Api).requires_caller);
        assert!(rules.rule(KeyType::Recovery).requires_caller);
        assert!(!rules.rule(KeyType::Refresh).issuable);
        assert!(rules.rule(KeyType::Api).persisted);
        assert!(!rules.rule(KeyType::Login).persisted);
    }

    #[test]
    fn test_out_of_range_lifetime_is_rejected() {
        for config in [
            KeysConfig {
                recovery_duration: u64::MAX,
                ..KeysConfig::default()
            },
            KeysConfig {
                login_duration: 9_300_000_000_000_000,
                ..KeysConfig::default()
            },
            KeysConfig {
                api_key_max_duration: Some(u64::MAX),
                ..KeysConfig::default()
            },
        ] {
            assert!(matches!(
                KeyRules::from_config(&config),
                Err(AuthError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_overflowing_expiry_is_an_error() {
        let rules = KeyRules::from_config(&KeysConfig {
            login_duration: 100_000_000_000_000,
            ..KeysConfig::default()
        })
        .unwrap();

        assert!(matches!(
            rules.rule(KeyType::Login).expiry(Utc::now(), None),
            Err(AuthError::InvalidConfig(_))
        ));
    }
}
