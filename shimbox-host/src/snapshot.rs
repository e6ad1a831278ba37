//! Snapshot persistence for sandbox state
//!
//! A snapshot is a JSON document holding every live key (with its handle
//! and values) and every file redirection. It seeds the stores when a
//! sandbox starts and receives their contents when the guest exits.
//!
//! The `checksum` field is a blake3 hash of the serialized payload, so a
//! hand-edited or truncated file is rejected instead of half-loaded.

use crate::files::FileTable;
use crate::registry::{RegistryStore, StoreError, VirtualKey, WriteMode};
use serde::{Deserialize, Serialize};
use shimbox_api::FileEntry;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Current on-disk format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Error type for snapshot operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to access snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse snapshot: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Snapshot checksum mismatch: recorded {recorded}, computed {computed}")]
    Corrupted { recorded: String, computed: String },

    #[error("Failed to seed store: {0}")]
    Store(#[from] StoreError),
}

/// Persisted contents of a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSnapshot {
    pub version: u32,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub keys: Vec<VirtualKey>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Serialize)]
struct Payload<'a> {
    keys: &'a [VirtualKey],
    files: &'a [FileEntry],
}

impl SandboxSnapshot {
    /// Snapshot with no content
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn new(keys: Vec<VirtualKey>, files: Vec<FileEntry>) -> Self {
        let mut snapshot = Self {
            version: SNAPSHOT_VERSION,
            checksum: String::new(),
            keys,
            files,
        };
        snapshot.checksum = snapshot.compute_checksum();
        snapshot
    }

    /// Copy the live contents of both stores
    pub fn capture(registry: &RegistryStore, files: &FileTable) -> Self {
        Self::new(registry.snapshot(), files.entries())
    }

    /// Read a snapshot file; a missing file yields an empty snapshot
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No snapshot on disk, starting empty");
            return Ok(Self::empty());
        }

        let reader = BufReader::new(File::open(path)?);
        let snapshot: Self = serde_json::from_reader(reader)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        let computed = snapshot.compute_checksum();
        if computed != snapshot.checksum {
            return Err(SnapshotError::Corrupted {
                recorded: snapshot.checksum,
                computed,
            });
        }
        Ok(snapshot)
    }

    /// Write the snapshot, replacing the target file only once fully written
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let staging = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }
        fs::rename(&staging, path)?;

        tracing::info!(
            path = %path.display(),
            keys = self.keys.len(),
            files = self.files.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    /// Bulk-populate the stores, reserving every recorded handle
    pub fn apply(&self, registry: &RegistryStore, files: &FileTable) -> Result<(), SnapshotError> {
        for key in &self.keys {
            registry.write_key(key.clone(), WriteMode::Replace)?;
        }
        for entry in &self.files {
            files.register(entry.clone())?;
        }
        tracing::info!(
            keys = self.keys.len(),
            files = self.files.len(),
            "Stores seeded from snapshot"
        );
        Ok(())
    }

    fn compute_checksum(&self) -> String {
        let payload = Payload {
            keys: &self.keys,
            files: &self.files,
        };
        // Serializing plain vectors and ordered maps cannot fail
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}
