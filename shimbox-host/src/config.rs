//! Host configuration and the explicit context handed to the core
//!
//! [`HostConfig`] is the serializable part (read from a JSON file or built
//! in code). [`HostContextBuilder`] turns it into a [`HostContext`]: the
//! shared stores, the change journal and the config itself, constructed once
//! at startup and passed to the channel server and supervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shimbox_api::KeyHandle;
use thiserror::Error;

use crate::files::FileTable;
use crate::handle::HandleAllocator;
use crate::journal::{ChangeSink, FileChangeSink, JournalError, NullChangeSink};
use crate::registry::RegistryStore;
use crate::snapshot::{SandboxSnapshot, SnapshotError};

/// Error type for configuration loading and context assembly
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to open change journal: {0}")]
    Journal(#[from] JournalError),

    #[error("Failed to seed sandbox: {0}")]
    Snapshot(#[from] SnapshotError),
}

fn default_lock_timeout_ms() -> u64 {
    2500
}

fn default_first_handle() -> KeyHandle {
    1
}

fn default_last_handle() -> KeyHandle {
    KeyHandle::MAX
}

fn default_bind_address() -> String {
    "127.0.0.1:0".to_string()
}

fn default_true() -> bool {
    true
}

/// Serializable host settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Maximum wait for a store write lock, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_first_handle")]
    pub first_handle: KeyHandle,
    #[serde(default = "default_last_handle")]
    pub last_handle: KeyHandle,
    /// Loopback address the channel listens on; port 0 picks a free port
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Interception library handed to the guest
    #[serde(default)]
    pub interception_library: Option<PathBuf>,
    /// Snapshot used to seed the stores and receive them on exit
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// JSONL change journal
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub flush_on_exit: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            first_handle: default_first_handle(),
            last_handle: default_last_handle(),
            bind_address: default_bind_address(),
            interception_library: None,
            snapshot_path: None,
            journal_path: None,
            flush_on_exit: true,
        }
    }
}

impl HostConfig {
    /// Read a JSON config file; absent fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/<app>/host.json`
    pub fn default_path(app_name: &str) -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(app_name).join("host.json"))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.first_handle > self.last_handle {
            return Err(ConfigError::Invalid(format!(
                "first_handle {} is above last_handle {}",
                self.first_handle, self.last_handle
            )));
        }
        if self.last_handle == 0 {
            return Err(ConfigError::Invalid(
                "handle range must contain a non-zero handle".into(),
            ));
        }
        Ok(())
    }
}

/// Everything the core needs, constructed once and shared by reference
#[derive(Clone)]
pub struct HostContext {
    pub config: HostConfig,
    pub registry: Arc<RegistryStore>,
    pub files: Arc<FileTable>,
    pub journal: Arc<dyn ChangeSink>,
}

impl HostContext {
    /// Context with default settings, empty stores and no journal
    pub fn in_memory() -> Self {
        let config = HostConfig::default();
        Self {
            registry: Arc::new(RegistryStore::new()),
            files: Arc::new(FileTable::new()),
            journal: Arc::new(NullChangeSink),
            config,
        }
    }

    /// Capture the stores into the configured snapshot file
    ///
    /// Returns `Ok(false)` when no snapshot path is configured.
    pub fn flush_snapshot(&self) -> Result<bool, SnapshotError> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(false);
        };
        SandboxSnapshot::capture(&self.registry, &self.files).save(path)?;
        if let Err(e) = self.journal.flush() {
            tracing::warn!(error = %e, "Failed to flush change journal");
        }
        Ok(true)
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("config", &self.config)
            .field("keys", &self.registry.len())
            .field("files", &self.files.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`HostContext`]
pub struct HostContextBuilder {
    config: HostConfig,
    journal: Option<Arc<dyn ChangeSink>>,
    seed: bool,
}

impl HostContextBuilder {
    pub fn new() -> Self {
        Self {
            config: HostConfig::default(),
            journal: None,
            seed: true,
        }
    }

    /// Use a complete configuration
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the write-lock timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Bound the handle range
    pub fn handle_range(mut self, first: KeyHandle, last: KeyHandle) -> Self {
        self.config.first_handle = first;
        self.config.last_handle = last;
        self
    }

    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot_path = Some(path.into());
        self
    }

    /// Use a custom journal sink instead of the configured file
    pub fn journal(mut self, sink: impl ChangeSink + 'static) -> Self {
        self.journal = Some(Arc::new(sink));
        self
    }

    /// Skip loading the snapshot into the stores
    pub fn without_seed(mut self) -> Self {
        self.seed = false;
        self
    }

    /// Build the context, seeding the stores from the snapshot if configured
    pub fn build(self) -> Result<HostContext, ConfigError> {
        let config = self.config;
        config.validate()?;

        let allocator = HandleAllocator::with_range(config.first_handle, config.last_handle);
        let registry = Arc::new(RegistryStore::with_allocator(
            allocator,
            config.lock_timeout(),
        ));
        let files = Arc::new(FileTable::with_timeout(config.lock_timeout()));

        let journal: Arc<dyn ChangeSink> = match (self.journal, &config.journal_path) {
            (Some(sink), _) => sink,
            (None, Some(path)) => Arc::new(FileChangeSink::new(path)?),
            (None, None) => Arc::new(NullChangeSink),
        };

        if self.seed {
            if let Some(path) = &config.snapshot_path {
                SandboxSnapshot::load(path)?.apply(&registry, &files)?;
            }
        }

        tracing::debug!(
            first_handle = config.first_handle,
            last_handle = config.last_handle,
            lock_timeout_ms = config.lock_timeout_ms,
            "Host context built"
        );

        Ok(HostContext {
            config,
            registry,
            files,
            journal,
        })
    }
}

impl Default for HostContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryChangeSink;
    use shimbox_api::VirtualValue;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.lock_timeout(), Duration::from_millis(2500));
        assert_eq!(config.first_handle, 1);
        assert_eq!(config.last_handle, KeyHandle::MAX);
        assert_eq!(config.bind_address, "127.0.0.1:0");
        assert!(config.flush_on_exit);
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(&path, r#"{ "lock_timeout_ms": 100, "last_handle": 10 }"#).unwrap();

        let config = HostConfig::from_file(&path).unwrap();
        assert_eq!(config.lock_timeout_ms, 100);
        assert_eq!(config.last_handle, 10);
        assert_eq!(config.first_handle, 1);
        assert!(config.snapshot_path.is_none());
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            HostConfig::from_file(dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            HostConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));

        std::fs::write(&path, r#"{ "first_handle": 9, "last_handle": 3 }"#).unwrap();
        assert!(matches!(
            HostConfig::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_builder_applies_range_and_journal() {
        let context = HostContextBuilder::new()
            .handle_range(100, 200)
            .lock_timeout(Duration::from_millis(10))
            .journal(MemoryChangeSink::new())
            .build()
            .unwrap();

        assert_eq!(context.registry.lock_timeout(), Duration::from_millis(10));
        let (_, handle, _) = context.registry.create_key("K").unwrap();
        assert_eq!(handle, 100);
    }

    #[test]
    fn test_builder_seeds_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        let first = HostContextBuilder::new()
            .snapshot_path(&path)
            .build()
            .unwrap();
        let (_, handle, _) = first.registry.create_key("Software\\App").unwrap();
        first
            .registry
            .set_value(handle, VirtualValue::dword("Runs", 1))
            .unwrap();
        assert!(first.flush_snapshot().unwrap());

        let second = HostContextBuilder::new()
            .snapshot_path(&path)
            .build()
            .unwrap();
        let handle = second.registry.open_key("SOFTWARE\\APP").unwrap();
        assert_eq!(
            second.registry.query_value(handle, "Runs").1.as_dword(),
            Some(1)
        );

        let unseeded = HostContextBuilder::new()
            .snapshot_path(&path)
            .without_seed()
            .build()
            .unwrap();
        assert!(unseeded.registry.is_empty());
    }

    #[test]
    fn test_flush_without_path() {
        assert!(!HostContext::in_memory().flush_snapshot().unwrap());
    }
}
