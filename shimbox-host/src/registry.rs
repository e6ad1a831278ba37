//! Virtual registry store
//!
//! Holds every virtual key of a sandbox behind a single reader/writer lock.
//! Reads share the lock freely. Writers wait for the exclusive lock for at
//! most the configured timeout and fail with [`StoreError::LockTimeout`]
//! instead of blocking the calling guest thread forever.
//!
//! Semantic outcomes (unknown handle, missing value) are returned as
//! [`NativeResultCode`]s; only operational failures are errors.

use crate::handle::{HandleAllocator, HandleError, HandleUser};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use shimbox_api::{CreationDisposition, KeyHandle, NativeResultCode, VirtualValue};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Write-lock wait used when no timeout is configured
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2500);

/// Operational failures of a store operation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Could not acquire the write lock for {operation} within {timeout:?}")]
    LockTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error(transparent)]
    Handles(#[from] HandleError),

    #[error("Path '{path}' is already bound to handle {existing}")]
    PathConflict { path: String, existing: KeyHandle },

    #[error("Handle 0 cannot identify a key")]
    ReservedHandle,

    #[error("Value '{name}' of key {handle} has no storable type")]
    InvalidValue { handle: KeyHandle, name: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A key of the virtual registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualKey {
    pub handle: KeyHandle,
    /// Full hierarchical path, compared case-insensitively
    pub path: String,
    #[serde(default)]
    pub values: BTreeMap<String, VirtualValue>,
}

impl VirtualKey {
    /// Key with no values
    pub fn new(handle: KeyHandle, path: impl Into<String>) -> Self {
        Self {
            handle,
            path: path.into(),
            values: BTreeMap::new(),
        }
    }

    /// Add a value (builder style)
    pub fn with_value(mut self, value: VirtualValue) -> Self {
        self.values.insert(value.name.clone(), value);
        self
    }
}

/// How [`RegistryStore::write_key`] treats a key that is already live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Discard the live key's values and keep only the written ones
    Replace,
    /// Merge into the live key: new names are added, shared names are
    /// overwritten only when `overwrite` is set
    Preserve { overwrite: bool },
}

/// Locked contents of a store
#[derive(Debug, Default)]
struct KeyTable {
    keys: HashMap<KeyHandle, VirtualKey>,
    /// Lower-cased path -> handle
    paths: HashMap<String, KeyHandle>,
}

impl KeyTable {
    fn find_path(&self, path: &str) -> Option<KeyHandle> {
        self.paths.get(&fold_path(path)).copied()
    }

    fn insert(&mut self, key: VirtualKey) {
        self.paths.insert(fold_path(&key.path), key.handle);
        self.keys.insert(key.handle, key);
    }

    fn remove(&mut self, handle: KeyHandle) -> Option<VirtualKey> {
        let key = self.keys.remove(&handle)?;
        self.paths.remove(&fold_path(&key.path));
        Some(key)
    }
}

// Called by the allocator while the store already holds its write lock.
impl HandleUser for KeyTable {
    fn is_used_handle(&self, handle: KeyHandle) -> bool {
        self.keys.contains_key(&handle)
    }
}

fn fold_path(path: &str) -> String {
    path.to_lowercase()
}

/// The authoritative table of virtual keys for one sandbox
#[derive(Debug)]
pub struct RegistryStore {
    table: RwLock<KeyTable>,
    allocator: HandleAllocator,
    lock_timeout: Duration,
}

impl RegistryStore {
    /// Empty store with the default handle range and lock timeout
    pub fn new() -> Self {
        Self::with_allocator(HandleAllocator::new(), DEFAULT_LOCK_TIMEOUT)
    }

    /// Empty store using `allocator` and waiting at most `lock_timeout` for writes
    pub fn with_allocator(allocator: HandleAllocator, lock_timeout: Duration) -> Self {
        Self {
            table: RwLock::new(KeyTable::default()),
            allocator,
            lock_timeout,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn allocator(&self) -> &HandleAllocator {
        &self.allocator
    }

    /// Path of the live key with `handle`, if any
    pub fn is_known_key(&self, handle: KeyHandle) -> Option<String> {
        self.table.read().keys.get(&handle).map(|k| k.path.clone())
    }

    /// Handle of the live key at `path` (case-insensitive)
    pub fn open_key(&self, path: &str) -> Option<KeyHandle> {
        self.table.read().find_path(path)
    }

    /// Open the key at `path`, creating it when it does not exist yet
    pub fn create_key(
        &self,
        path: &str,
    ) -> StoreResult<(NativeResultCode, KeyHandle, CreationDisposition)> {
        if let Some(handle) = self.open_key(path) {
            return Ok((
                NativeResultCode::Success,
                handle,
                CreationDisposition::OpenedExisting,
            ));
        }

        let mut table = self.write("create_key")?;
        // Another writer may have created it between the read and the write lock
        if let Some(handle) = table.find_path(path) {
            return Ok((
                NativeResultCode::Success,
                handle,
                CreationDisposition::OpenedExisting,
            ));
        }

        let handle = self.allocator.next(&*table)?;
        table.insert(VirtualKey::new(handle, path));
        drop(table);

        tracing::debug!(handle, path, "Virtual key created");
        Ok((
            NativeResultCode::Success,
            handle,
            CreationDisposition::CreatedNew,
        ))
    }

    /// Delete the key with `handle` and release the handle
    pub fn delete_key(&self, handle: KeyHandle) -> StoreResult<NativeResultCode> {
        let removed = self.write("delete_key")?.remove(handle);
        let Some(key) = removed else {
            return Ok(NativeResultCode::InvalidHandle);
        };
        // Released only after the write lock is gone; until then the
        // allocator still counts the handle as assigned.
        self.allocator.release(handle);
        tracing::debug!(handle, path = %key.path, "Virtual key deleted");
        Ok(NativeResultCode::Success)
    }

    /// Look up value `name` of the key with `handle`
    ///
    /// On failure the returned value carries [`shimbox_api::ValueType::Invalid`].
    pub fn query_value(&self, handle: KeyHandle, name: &str) -> (NativeResultCode, VirtualValue) {
        let table = self.table.read();
        let Some(key) = table.keys.get(&handle) else {
            return (NativeResultCode::InvalidHandle, VirtualValue::invalid(name));
        };
        match key.values.get(name) {
            Some(value) => (NativeResultCode::Success, value.clone()),
            None => (NativeResultCode::FileNotFound, VirtualValue::invalid(name)),
        }
    }

    /// Insert or overwrite a value of the key with `handle`
    ///
    /// A value typed [`shimbox_api::ValueType::Invalid`] is refused with
    /// `InvalidParameter`.
    pub fn set_value(&self, handle: KeyHandle, value: VirtualValue) -> StoreResult<NativeResultCode> {
        if !value.value_type.is_valid() {
            return Ok(NativeResultCode::InvalidParameter);
        }
        let mut table = self.write("set_value")?;
        let Some(key) = table.keys.get_mut(&handle) else {
            return Ok(NativeResultCode::InvalidHandle);
        };
        key.values.insert(value.name.clone(), value);
        Ok(NativeResultCode::Success)
    }

    /// Remove value `name` from the key with `handle`
    pub fn delete_value(&self, handle: KeyHandle, name: &str) -> StoreResult<NativeResultCode> {
        let mut table = self.write("delete_value")?;
        let Some(key) = table.keys.get_mut(&handle) else {
            return Ok(NativeResultCode::InvalidHandle);
        };
        if key.values.remove(name).is_some() {
            Ok(NativeResultCode::Success)
        } else {
            Ok(NativeResultCode::FileNotFound)
        }
    }

    /// Write a key under its own handle, e.g. when seeding from a snapshot
    ///
    /// The handle is reserved in the allocator. A live key with the same
    /// handle is replaced or merged according to `mode`; a live key with the
    /// same path but another handle is a [`StoreError::PathConflict`]. Either
    /// mode leaves the key at the written path.
    pub fn write_key(&self, key: VirtualKey, mode: WriteMode) -> StoreResult<()> {
        if key.handle == 0 {
            return Err(StoreError::ReservedHandle);
        }
        if let Some(value) = key.values.values().find(|v| !v.value_type.is_valid()) {
            return Err(StoreError::InvalidValue {
                handle: key.handle,
                name: value.name.clone(),
            });
        }

        let mut table = self.write("write_key")?;
        if let Some(existing) = table.find_path(&key.path) {
            if existing != key.handle {
                return Err(StoreError::PathConflict {
                    path: key.path,
                    existing,
                });
            }
        }

        if !table.keys.contains_key(&key.handle) {
            self.allocator.reserve(key.handle);
            table.insert(key);
            return Ok(());
        }

        match mode {
            WriteMode::Replace => {
                table.remove(key.handle);
                table.insert(key);
            }
            WriteMode::Preserve { overwrite } => {
                if let Some(mut live) = table.remove(key.handle) {
                    for (name, value) in key.values {
                        if overwrite || !live.values.contains_key(&name) {
                            live.values.insert(name, value);
                        }
                    }
                    live.path = key.path;
                    table.insert(live);
                }
            }
        }
        Ok(())
    }

    /// Liveness check used by the allocator when called outside any lock
    pub fn is_used_index(&self, handle: KeyHandle) -> bool {
        self.table.read().is_used_handle(handle)
    }

    /// Hold a shared view of the store; writers wait until it is dropped
    pub fn view(&self) -> RegistryView<'_> {
        RegistryView {
            table: self.table.read(),
        }
    }

    /// Copy of every live key, ordered by handle
    pub fn snapshot(&self) -> Vec<VirtualKey> {
        let view = self.view();
        let mut keys: Vec<VirtualKey> = view.keys().cloned().collect();
        keys.sort_by_key(|k| k.handle);
        keys
    }

    pub fn len(&self) -> usize {
        self.table.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().keys.is_empty()
    }

    fn write(&self, operation: &'static str) -> StoreResult<RwLockWriteGuard<'_, KeyTable>> {
        self.table.try_write_for(self.lock_timeout).ok_or_else(|| {
            tracing::warn!(
                operation,
                timeout_ms = self.lock_timeout.as_millis() as u64,
                "Write lock unavailable"
            );
            StoreError::LockTimeout {
                operation,
                timeout: self.lock_timeout,
            }
        })
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleUser for RegistryStore {
    fn is_used_handle(&self, handle: KeyHandle) -> bool {
        self.is_used_index(handle)
    }
}

/// Shared, read-locked view of a [`RegistryStore`]
pub struct RegistryView<'a> {
    table: RwLockReadGuard<'a, KeyTable>,
}

impl RegistryView<'_> {
    pub fn keys(&self) -> impl Iterator<Item = &VirtualKey> {
        self.table.keys.values()
    }

    pub fn get(&self, handle: KeyHandle) -> Option<&VirtualKey> {
        self.table.keys.get(&handle)
    }

    pub fn len(&self) -> usize {
        self.table.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.keys.is_empty()
    }
}
