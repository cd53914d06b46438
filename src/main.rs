//! Event Reactor Server
//!
//! Receives pub/sub push messages and generic webhooks, evaluates the
//! configured rules and runs the matching actions.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `EVENT_REACTOR_CONFIG`: Rule document (JSON, YAML or TOML). Watched for changes.
//! - `EVENT_REACTOR_LISTEN_ADDR`: Bind address (default: "0.0.0.0:8080")
//! - `EVENT_REACTOR_SECRETS_DIR`: Root of the directory backed secret store
//! - `EVENT_REACTOR_DEBUG`: Default to debug logging when `RUST_LOG` is unset
//! - `RUST_LOG`: Logging filter (default: "info")

use event_reactor::action::ActionRegistry;
use event_reactor::api::{self, AppState};
use event_reactor::config::ServerConfig;
use event_reactor::dispatcher::Dispatcher;
use event_reactor::listener::ListenerSet;
use event_reactor::property::PropertyResolver;
use event_reactor::reload::{self, ConfigStore};
use event_reactor::secrets::{DirectorySecretStore, SecretStore, UnconfiguredSecretStore};
use event_reactor::shutdown::ShutdownSignal;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let debug = env::var("EVENT_REACTOR_DEBUG").is_ok_and(|v| !v.is_empty());
        EnvFilter::new(if debug { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn secret_store() -> Arc<dyn SecretStore> {
    match env::var("EVENT_REACTOR_SECRETS_DIR") {
        Ok(dir) if !dir.is_empty() => {
            info!(dir = %dir, "Using directory secret store");
            Arc::new(DirectorySecretStore::new(dir))
        }
        _ => Arc::new(UnconfiguredSecretStore),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ServerConfig::load()?;
    let registry = ActionRegistry::builtin(config.load_test_reactor);
    config.warn_unknown_types(&registry.names());

    let mut dispatcher = Dispatcher::new(Arc::new(registry), PropertyResolver::new(secret_store()))
        .with_strict_filters(config.strict_filter_evaluation);
    if let Some(secs) = config.action_timeout_secs {
        dispatcher = dispatcher.with_action_timeout(Duration::from_secs(secs));
    }

    info!(
        rules = config.reactor_configs.len(),
        actions = ?dispatcher.registry().names(),
        "Event Reactor starting"
    );

    let known_types: Vec<String> = dispatcher
        .registry()
        .names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let store = Arc::new(ConfigStore::new(config));
    let shutdown = ShutdownSignal::new();

    let watcher = match env::var("EVENT_REACTOR_CONFIG") {
        Ok(path) if !path.is_empty() => {
            match reload::watch(PathBuf::from(path), Arc::clone(&store), known_types, &shutdown) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "Config hot reload disabled");
                    None
                }
            }
        }
        _ => None,
    };

    let state = AppState::new(store, dispatcher, ListenerSet::builtin());
    let app = api::router(state);

    let addr = env::var("EVENT_REACTOR_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Event Reactor listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait().await })
        .await?;

    if let Some(handle) = watcher {
        if tokio::time::timeout(shutdown.timeout(), handle).await.is_err() {
            warn!("Config watcher did not stop in time");
        }
    }

    info!("Event Reactor stopped");
    Ok(())
}
