//! Virtual file table
//!
//! The filesystem counterpart of [`crate::registry::RegistryStore`]: guest
//! paths (case-insensitive) mapped to locations inside the sandbox, under
//! one reader/writer lock with the same bounded write wait.

use crate::registry::{StoreError, StoreResult, DEFAULT_LOCK_TIMEOUT};
use parking_lot::{RwLock, RwLockWriteGuard};
use shimbox_api::{FileEntry, NativeResultCode};
use std::collections::HashMap;
use std::time::Duration;

/// Redirection table for guest file paths
#[derive(Debug)]
pub struct FileTable {
    entries: RwLock<HashMap<String, FileEntry>>,
    lock_timeout: Duration,
}

impl FileTable {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_timeout(lock_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Where the guest's `path` is redirected to
    pub fn resolve(&self, path: &str) -> (NativeResultCode, Option<FileEntry>) {
        match self.entries.read().get(&fold(path)) {
            Some(entry) => (NativeResultCode::Success, Some(entry.clone())),
            None => (NativeResultCode::FileNotFound, None),
        }
    }

    /// Record a redirection, replacing any entry for the same path
    pub fn register(&self, entry: FileEntry) -> StoreResult<NativeResultCode> {
        if entry.path.is_empty() {
            return Ok(NativeResultCode::InvalidParameter);
        }
        let mut entries = self.write("register")?;
        entries.insert(fold(&entry.path), entry);
        Ok(NativeResultCode::Success)
    }

    /// Drop the redirection for `path`
    pub fn remove(&self, path: &str) -> StoreResult<NativeResultCode> {
        match self.write("remove")?.remove(&fold(path)) {
            Some(_) => Ok(NativeResultCode::Success),
            None => Ok(NativeResultCode::FileNotFound),
        }
    }

    /// Every entry, ordered by path
    pub fn entries(&self) -> Vec<FileEntry> {
        let mut entries: Vec<FileEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn write(
        &self,
        operation: &'static str,
    ) -> StoreResult<RwLockWriteGuard<'_, HashMap<String, FileEntry>>> {
        self.entries
            .try_write_for(self.lock_timeout)
            .ok_or(StoreError::LockTimeout {
                operation,
                timeout: self.lock_timeout,
            })
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

fn fold(path: &str) -> String {
    path.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let table = FileTable::new();
        let entry = FileEntry::file("C:\\Program Files\\App\\app.ini", "files/app.ini");
        assert_eq!(
            table.register(entry.clone()).unwrap(),
            NativeResultCode::Success
        );

        let (code, resolved) = table.resolve("c:\\program files\\app\\APP.INI");
        assert_eq!(code, NativeResultCode::Success);
        assert_eq!(resolved, Some(entry));
    }

    #[test]
    fn test_remove() {
        let table = FileTable::new();
        table
            .register(FileEntry::directory("C:\\Data", "data"))
            .unwrap();
        assert_eq!(table.remove("c:\\data").unwrap(), NativeResultCode::Success);
        assert_eq!(
            table.remove("c:\\data").unwrap(),
            NativeResultCode::FileNotFound
        );
        assert_eq!(table.resolve("C:\\Data").0, NativeResultCode::FileNotFound);
    }

    #[test]
    fn test_empty_path_rejected() {
        let table = FileTable::new();
        assert_eq!(
            table.register(FileEntry::file("", "x")).unwrap(),
            NativeResultCode::InvalidParameter
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_entries_sorted() {
        let table = FileTable::new();
        table.register(FileEntry::file("b", "1")).unwrap();
        table.register(FileEntry::file("a", "2")).unwrap();
        let paths: Vec<_> = table.entries().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["a", "b"]);
    }
}
