//! Hot reload of the rule document.
//!
//! The active configuration lives in a [`ConfigStore`] as an immutable
//! `Arc<ServerConfig>`. Each request takes one snapshot and uses it for the
//! whole dispatch; a reload swaps the `Arc` wholesale, so a request never sees
//! half of an old document and half of a new one.
//!
//! [`watch`] follows the file's parent directory (editors and config map
//! mounts replace files rather than writing them in place) and reloads when
//! the file is created or modified. A document that fails to read, parse or
//! validate is logged and the previous snapshot stays active.

use crate::config::{ConfigError, ConfigFormat, ServerConfig};
use crate::shutdown::ShutdownSignal;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Quiet period used to coalesce bursts of file events into one reload
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Errors starting the watcher
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("config path '{0}' has no file name")]
    InvalidPath(PathBuf),

    #[error("failed to watch '{path}': {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Holder of the active configuration snapshot.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<ServerConfig>>,
}

impl ConfigStore {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// The active configuration
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        // Only ever holds a fully built Arc, so a poisoned lock is still valid.
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Make `config` active and return the previous snapshot
    pub fn replace(&self, config: ServerConfig) -> Arc<ServerConfig> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(config))
    }
}

/// Load `path` and make it active. The store is untouched on error.
///
/// Rules whose type is not in `known_types` are logged, as at startup.
pub async fn reload(
    path: &Path,
    store: &ConfigStore,
    known_types: &[&str],
) -> Result<Arc<ServerConfig>, ConfigError> {
    let content = tokio::fs::read_to_string(path).await?;
    let config = ServerConfig::parse(&content, ConfigFormat::from_path(path))?;
    let rules = config.reactor_configs.len();
    let unknown = config.warn_unknown_types(known_types).len();
    store.replace(config);

    let current = store.snapshot();
    info!(path = %path.display(), rules, unknown, "Configuration reloaded");
    Ok(current)
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

/// Watch `path` and reload `store` on change until `shutdown` fires.
///
/// `known_types` are the registered action types, used to warn about rules
/// the reloaded document adds with an unknown type.
pub fn watch(
    path: PathBuf,
    store: Arc<ConfigStore>,
    known_types: Vec<String>,
    shutdown: &ShutdownSignal,
) -> Result<JoinHandle<()>, ReloadError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| ReloadError::InvalidPath(path.clone()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if is_relevant(&event, &file_name) {
                    let _ = tx.send(());
                }
            }
            Err(e) => error!(error = %e, "Config watch error"),
        },
        notify::Config::default(),
    )
    .map_err(|source| ReloadError::Watch {
        path: dir.clone(),
        source,
    })?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|source| ReloadError::Watch {
            path: dir.clone(),
            source,
        })?;

    info!(path = %path.display(), "Watching configuration for changes");

    let mut stop = shutdown.subscribe();
    let handle = tokio::spawn(async move {
        // The watcher stops when dropped, so the task owns it.
        let _watcher = watcher;
        let known: Vec<&str> = known_types.iter().map(String::as_str).collect();

        loop {
            tokio::select! {
                changed = rx.recv() => {
                    if changed.is_none() {
                        warn!("Config watcher closed");
                        break;
                    }

                    tokio::time::sleep(DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}

                    debug!(path = %path.display(), "Configuration file changed");
                    if let Err(e) = reload(&path, &store, &known).await {
                        error!(
                            path = %path.display(),
                            error = %e,
                            "Failed to reload configuration, keeping the previous one"
                        );
                    }
                }
                _ = stop.recv() => {
                    debug!("Stopping config watcher");
                    break;
                }
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const FIRST: &str = r#"{"reactorConfigs": [{"name": "a", "type": "log"}]}"#;
    const KNOWN: &[&str] = &["log", "webhook"];

    fn known() -> Vec<String> {
        KNOWN.iter().map(|s| s.to_string()).collect()
    }

    const SECOND: &str = r#"{"reactorConfigs": [{"name": "a", "type": "log"}, {"name": "b", "type": "webhook"}]}"#;

    #[test]
    fn test_snapshot_survives_replace() {
        let store = ConfigStore::new(ServerConfig::default());
        let before = store.snapshot();

        let old = store.replace(ServerConfig::parse(FIRST, None).unwrap());

        assert!(Arc::ptr_eq(&before, &old));
        assert!(before.reactor_configs.is_empty());
        assert_eq!(store.snapshot().reactor_configs.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_keeps_previous_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, FIRST).unwrap();

        let store = ConfigStore::new(ServerConfig::default());
        reload(&path, &store, KNOWN).await.unwrap();
        assert_eq!(store.snapshot().rule_names(), vec!["a"]);

        fs::write(&path, "{ not valid").unwrap();
        assert!(reload(&path, &store, KNOWN).await.is_err());
        assert_eq!(store.snapshot().rule_names(), vec!["a"]);

        fs::remove_file(&path).unwrap();
        assert!(matches!(
            reload(&path, &store, KNOWN).await,
            Err(ConfigError::ReadError(_))
        ));
        assert_eq!(store.snapshot().rule_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_reload_accepts_unknown_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, SECOND).unwrap();

        let store = ConfigStore::new(ServerConfig::default());
        let current = reload(&path, &store, &["log"]).await.unwrap();

        assert_eq!(current.warn_unknown_types(&["log"]), vec!["b"]);
        assert_eq!(store.snapshot().rule_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_watch_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, FIRST).unwrap();

        let store = Arc::new(ConfigStore::new(ServerConfig::load_from(&path).unwrap()));
        let shutdown = ShutdownSignal::new();
        let handle = watch(path.clone(), Arc::clone(&store), known(), &shutdown).unwrap();

        // Give the backend a moment to register the directory.
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&path, SECOND).unwrap();

        let mut reloaded = false;
        for _ in 0..50 {
            if store.snapshot().reactor_configs.len() == 2 {
                reloaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(reloaded, "configuration was not reloaded");

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_watch_rejects_path_without_file_name() {
        let shutdown = ShutdownSignal::new();
        let store = Arc::new(ConfigStore::new(ServerConfig::default()));
        let err = watch(PathBuf::from("/"), store, known(), &shutdown).unwrap_err();
        assert!(matches!(err, ReloadError::InvalidPath(_)));
    }
}
