use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::secrets::generate_secret;

/// Authentication service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Key issuance settings
    #[serde(default)]
    pub keys: KeysConfig,

    /// Policy agent settings
    #[serde(default)]
    pub policies: PolicyConfig,

    /// Permission schema for the embedded engine
    #[serde(default)]
    pub engine: EngineConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Audit event settings
    #[serde(default)]
    pub events: EventsConfig,

    /// Seed credentials for the built-in identity provider (subject -> password)
    #[serde(default)]
    pub identities: HashMap<String, String>,
}

/// Key issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Secret used to sign every issued key
    #[serde(default = "default_signing_secret")]
    pub secret: String,
    /// Token issuer
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Login key lifetime in seconds (default: 30 minutes)
    #[serde(default = "default_login_duration")]
    pub login_duration: u64,
    /// Refresh key lifetime in seconds (default: 24 hours)
    #[serde(default = "default_refresh_duration")]
    pub refresh_duration: u64,
    /// Recovery key lifetime in seconds (default: 5 minutes), not caller-adjustable
    #[serde(default = "default_recovery_duration")]
    pub recovery_duration: u64,
    /// Upper bound on a caller-requested API key lifetime, in seconds.
    /// `None` leaves API keys unbounded.
    #[serde(default)]
    pub api_key_max_duration: Option<u64>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            secret: default_signing_secret(),
            issuer: default_issuer(),
            login_duration: default_login_duration(),
            refresh_duration: default_refresh_duration(),
            recovery_duration: default_recovery_duration(),
            api_key_max_duration: None,
        }
    }
}

fn default_signing_secret() -> String {
    "insecure_default_secret_please_change_in_production".to_owned()
}

fn default_issuer() -> String {
    "flux-auth".to_owned()
}

const fn default_login_duration() -> u64 {
    1800 // 30 minutes
}

const fn default_refresh_duration() -> u64 {
    86400 // 24 hours
}

const fn default_recovery_duration() -> u64 {
    300 // 5 minutes
}

/// Policy agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Page size used when draining every page of a lookup
    #[serde(default = "default_retrieve_all_page_size")]
    pub retrieve_all_page_size: u32,
    /// Timeout for each engine call and each streamed element, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl PolicyConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            retrieve_all_page_size: default_retrieve_all_page_size(),
            request_timeout: default_request_timeout(),
        }
    }
}

const fn default_retrieve_all_page_size() -> u32 {
    1000
}

const fn default_request_timeout() -> u64 {
    10
}

/// Permission schema: object type -> permission -> relations granting it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_schema")]
    pub schema: HashMap<String, HashMap<String, Vec<String>>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
        }
    }
}

/// Platform schema for users, groups and things
fn default_schema() -> HashMap<String, HashMap<String, Vec<String>>> {
    fn permissions(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(permission, relations)| {
                let relations = relations.iter().map(|r| (*r).to_owned()).collect();
                ((*permission).to_owned(), relations)
            })
            .collect()
    }

    HashMap::from([
        ("user".to_owned(), permissions(&[("admin", &["admin"])])),
        (
            "group".to_owned(),
            permissions(&[
                ("admin", &["admin"]),
                ("view", &["admin", "member", "viewer"]),
                ("membership", &["admin", "member", "viewer"]),
            ]),
        ),
        (
            "thing".to_owned(),
            permissions(&[
                ("admin", &["owner", "admin"]),
                ("view", &["owner", "admin", "viewer"]),
                ("publish", &["owner", "admin", "publisher"]),
                ("subscribe", &["owner", "admin", "subscriber"]),
            ]),
        ),
    ])
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// RocksDB storage
    #[serde(rename = "rocksdb")]
    RocksDB {
        /// The path to the RocksDB database
        path: PathBuf,
    },

    /// In-memory storage (for development only)
    #[default]
    #[serde(rename = "memory")]
    Memory,
}

/// Audit event configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Number of events buffered before new ones are dropped
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

const fn default_event_capacity() -> usize {
    1024
}

/// Load the configuration from a file
///
/// Values can be overridden from the environment, e.g.
/// `AUTH__KEYS__LOGIN_DURATION=600`.
///
/// # Arguments
///
/// * `path` - The path to the configuration file
///
/// # Returns
///
/// * `Result<AuthConfig, eyre::Error>` - The loaded configuration
pub fn load_config(path: &str) -> eyre::Result<AuthConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("AUTH").separator("__"))
        .build()?
        .try_deserialize()?;

    Ok(config)
}

/// Generate a default configuration with a fresh random signing secret
pub fn default_config() -> AuthConfig {
    AuthConfig {
        keys: KeysConfig {
            secret: generate_secret(),
            ..KeysConfig::default()
        },
        ..AuthConfig::default()
    }
}
