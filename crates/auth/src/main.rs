use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use eyre::{Result, WrapErr};
use flux_auth::config::{default_config, load_config, AuthConfig};
use flux_auth::events::{AuditedService, EventPublisher, TracingSink};
use flux_auth::policies::memory::MemoryEngine;
use flux_auth::policies::{spawn_watcher, ChangeEvent, ChangeHandler};
use flux_auth::providers::UserPasswordProvider;
use flux_auth::secrets::SigningKey;
use flux_auth::storage::{create_storage, StorageKeyStore};
use flux_auth::{AuthService, PolicyAgent, TokenManager};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Flux authentication and authorization daemon
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[clap(short, long, value_parser, env = "FLUX_AUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (can be specified multiple times)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Logs every relationship change seen on the feed
struct LogChanges;

#[async_trait]
impl ChangeHandler for LogChanges {
    async fn handle(&mut self, event: ChangeEvent) {
        info!(
            operation = event.operation.as_str(),
            subject = %event.policy.subject,
            relation = %event.policy.relation,
            object_type = %event.policy.object_type,
            object = %event.policy.object,
            changes_through = %event.changes_through,
            "policy changed"
        );
    }
}

fn config_from(cli: &Cli) -> Result<AuthConfig> {
    let Some(path) = &cli.config else {
        info!("Using default configuration");
        return Ok(default_config());
    };

    info!("Loading configuration from {}", path.display());
    let path = path
        .to_str()
        .ok_or_else(|| eyre::eyre!("configuration path is not valid UTF-8"))?;

    load_config(path).wrap_err("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "flux_auth=info,flux_authd=info".into()),
        1 => tracing_subscriber::EnvFilter::new("debug"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config_from(&cli)?;

    let storage = create_storage(&config.storage).wrap_err("failed to create storage")?;

    let identity = UserPasswordProvider::new(Arc::clone(&storage));
    for (subject, password) in &config.identities {
        identity
            .register(subject, password)
            .await
            .wrap_err_with(|| format!("failed to register identity {subject}"))?;
    }
    info!("Registered {} seed identities", config.identities.len());

    let engine = Arc::new(MemoryEngine::from_config(&config.engine));
    let policies = PolicyAgent::new(engine, config.policies.clone());

    let tokens = TokenManager::new(
        &config.keys,
        SigningKey::from_secret(config.keys.secret.as_bytes()),
        Arc::new(StorageKeyStore::new(Arc::clone(&storage))),
        Arc::new(identity),
        policies.clone(),
    )
    .wrap_err("invalid key configuration")?;

    let (events, sink) = EventPublisher::spawn(TracingSink, config.events.capacity);
    let service = AuditedService::new(AuthService::new(tokens, policies.clone()), events);

    let cancel = CancellationToken::new();
    let watcher = spawn_watcher(&policies, String::new(), cancel.clone(), LogChanges)
        .await
        .wrap_err("failed to open policy change feed")?;

    info!(issuer = %config.keys.issuer, "Authorization service ready");

    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for shutdown signal")?;
    info!("Shutdown signal received, shutting down");

    cancel.cancel();
    match watcher.await {
        Ok(outcome) => {
            if let Some(error) = outcome.error {
                warn!(%error, "policy watcher ended with an error");
            }
            info!(last_token = %outcome.last_token, "policy watcher stopped");
        }
        Err(err) => warn!(%err, "policy watcher task failed"),
    }

    drop(service);
    if let Err(err) = sink.await {
        warn!(%err, "audit sink task failed");
    }

    Ok(())
}
