//! Secret store interface used by `secretKeyRef` properties.
//!
//! The dispatch path only reads secrets. Three stores are provided:
//!
//! - [`MemorySecretStore`]: fixed in-memory map, for tests and embedding
//! - [`DirectorySecretStore`]: one file per version under
//!   `<root>/<project>/<name>/<version>` (the layout of a mounted secret
//!   volume)
//! - [`UnconfiguredSecretStore`]: every lookup fails with a clear message

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Version keyword resolving to the newest version
pub const LATEST_VERSION: &str = "latest";

/// Errors returned by a secret store.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {project}/{name}/{version} was not found")]
    NotFound {
        project: String,
        name: String,
        version: String,
    },

    #[error("failed to read the secret: {0}")]
    Io(#[from] std::io::Error),

    #[error("no secret store is configured")]
    Unconfigured,
}

/// Read access to secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the value of `name` at `version` within `project` (or namespace).
    async fn get_secret(
        &self,
        project: &str,
        name: &str,
        version: &str,
    ) -> Result<String, SecretError>;
}

/// In-memory secrets keyed by `(project, name, version)`.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    secrets: HashMap<(String, String, String), String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret value
    pub fn with_secret(
        mut self,
        project: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.secrets
            .insert((project.into(), name.into(), version.into()), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(
        &self,
        project: &str,
        name: &str,
        version: &str,
    ) -> Result<String, SecretError> {
        self.secrets
            .get(&(project.to_string(), name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                project: project.to_string(),
                name: name.to_string(),
                version: version.to_string(),
            })
    }
}

/// Secrets stored as files, one per version.
///
/// `latest` reads a file literally named `latest` when present, otherwise the
/// numerically highest version file.
#[derive(Debug, Clone)]
pub struct DirectorySecretStore {
    root: PathBuf,
}

impl DirectorySecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn latest_version(&self, dir: &std::path::Path) -> Result<Option<String>, SecretError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<u64> = None;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u64>().ok())
            {
                newest = Some(newest.map_or(version, |n| n.max(version)));
            }
        }
        Ok(newest.map(|v| v.to_string()))
    }
}

#[async_trait]
impl SecretStore for DirectorySecretStore {
    async fn get_secret(
        &self,
        project: &str,
        name: &str,
        version: &str,
    ) -> Result<String, SecretError> {
        let not_found = || SecretError::NotFound {
            project: project.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        };

        // reject path traversal through any of the components
        if [project, name, version]
            .iter()
            .any(|part| part.is_empty() || part.contains(['/', '\\']) || *part == "..")
        {
            return Err(not_found());
        }

        let dir = self.root.join(project).join(name);
        let mut path = dir.join(version);

        if version == LATEST_VERSION && !tokio::fs::try_exists(&path).await? {
            match self.latest_version(&dir).await? {
                Some(newest) => path = dir.join(newest),
                None => return Err(not_found()),
            }
        }

        debug!(path = %path.display(), "Reading secret file");
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Store used when no secret backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredSecretStore;

#[async_trait]
impl SecretStore for UnconfiguredSecretStore {
    async fn get_secret(
        &self,
        _project: &str,
        _name: &str,
        _version: &str,
    ) -> Result<String, SecretError> {
        Err(SecretError::Unconfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySecretStore::new().with_secret("proj", "token", "1", "s3cr3t");
        assert_eq!(store.get_secret("proj", "token", "1").await.unwrap(), "s3cr3t");
        assert!(matches!(
            store.get_secret("proj", "token", "2").await,
            Err(SecretError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_directory_store_versions() {
        let dir = tempfile::tempdir().unwrap();
        let secret_dir = dir.path().join("proj").join("token");
        std::fs::create_dir_all(&secret_dir).unwrap();
        std::fs::write(secret_dir.join("1"), "old").unwrap();
        std::fs::write(secret_dir.join("10"), "new").unwrap();
        std::fs::write(secret_dir.join("2"), "mid").unwrap();

        let store = DirectorySecretStore::new(dir.path());
        assert_eq!(store.get_secret("proj", "token", "2").await.unwrap(), "mid");
        assert_eq!(
            store.get_secret("proj", "token", LATEST_VERSION).await.unwrap(),
            "new"
        );
    }

    #[tokio::test]
    async fn test_directory_store_missing_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectorySecretStore::new(dir.path());

        assert!(matches!(
            store.get_secret("proj", "missing", "latest").await,
            Err(SecretError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_secret("..", "etc", "passwd").await,
            Err(SecretError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_store() {
        let err = UnconfiguredSecretStore
            .get_secret("p", "n", "latest")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no secret store is configured");
    }
}
