//! Change journal for virtual resources
//!
//! Every mutation a guest makes through the synchronizer is described by a
//! [`ChangeEvent`] and handed to a [`ChangeSink`]. Sinks are pluggable so a
//! host can keep the journal in memory, append it to a JSONL file, or fan
//! it out to several destinations.

use serde::Serialize;
use shimbox_api::{KeyHandle, ValueType};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

/// A single recorded mutation
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    /// RFC 3339 UTC timestamp
    pub timestamp: String,
    /// Guest process that made the change, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    pub change: Change,
}

impl ChangeEvent {
    pub fn new(change: Change) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            process_id: None,
            change,
        }
    }

    /// Attribute the change to a guest process
    pub fn with_process(mut self, process_id: u32) -> Self {
        self.process_id = Some(process_id);
        self
    }
}

/// What changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Change {
    KeyCreated { handle: KeyHandle, path: String },
    KeyDeleted { handle: KeyHandle },
    ValueSet {
        handle: KeyHandle,
        name: String,
        value_type: ValueType,
    },
    ValueDeleted { handle: KeyHandle, name: String },
    FileRegistered { path: String, location: String },
    FileRemoved { path: String },
}

impl Change {
    /// Event type name as it appears in the serialized journal
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeyCreated { .. } => "key_created",
            Self::KeyDeleted { .. } => "key_deleted",
            Self::ValueSet { .. } => "value_set",
            Self::ValueDeleted { .. } => "value_deleted",
            Self::FileRegistered { .. } => "file_registered",
            Self::FileRemoved { .. } => "file_removed",
        }
    }
}

/// Error type for journal operations
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Failed to write journal: {0}")]
    WriteError(#[from] std::io::Error),

    #[error("Failed to serialize change event: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Journal sink not available: {0}")]
    Unavailable(String),
}

/// Destination for change events
///
/// # Example
///
/// ```rust
/// use shimbox_host::journal::{ChangeEvent, ChangeSink, JournalError};
///
/// struct StderrSink;
///
/// impl ChangeSink for StderrSink {
///     fn record(&self, event: ChangeEvent) -> Result<(), JournalError> {
///         eprintln!("{}", event.change.kind());
///         Ok(())
///     }
///
///     fn flush(&self) -> Result<(), JournalError> {
///         Ok(())
///     }
/// }
/// ```
pub trait ChangeSink: Send + Sync {
    /// Record a change event
    fn record(&self, event: ChangeEvent) -> Result<(), JournalError>;

    /// Flush any buffered events
    fn flush(&self) -> Result<(), JournalError>;

    /// Check if the sink is healthy/available
    fn is_healthy(&self) -> bool {
        true
    }
}

// ============================================================================
// Default Implementations
// ============================================================================

/// File-based sink writing one JSON object per line
pub struct FileChangeSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileChangeSink {
    /// Open (or create) the journal file in append mode
    pub fn new(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChangeSink for FileChangeSink {
    fn record(&self, event: ChangeEvent) -> Result<(), JournalError> {
        let json = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{}", json)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), JournalError> {
        let mut writer = self.writer.lock().unwrap();
        writer.flush()?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.path.parent().map(|p| p.exists()).unwrap_or(true)
    }
}

impl fmt::Debug for FileChangeSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChangeSink")
            .field("path", &self.path)
            .finish()
    }
}

/// Bounded in-memory sink; the oldest event is evicted when full
pub struct MemoryChangeSink {
    events: RwLock<VecDeque<ChangeEvent>>,
    max_events: usize,
}

impl MemoryChangeSink {
    /// Sink keeping the last 1000 events
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(max_events.min(1000))),
            max_events,
        }
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.read().unwrap().iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.events.read().unwrap().len()
    }

    pub fn clear(&self) {
        self.events.write().unwrap().clear();
    }

    /// Events whose change has the given [`Change::kind`]
    pub fn find_by_kind(&self, kind: &str) -> Vec<ChangeEvent> {
        self.events
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.change.kind() == kind)
            .cloned()
            .collect()
    }
}

impl Default for MemoryChangeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSink for MemoryChangeSink {
    fn record(&self, event: ChangeEvent) -> Result<(), JournalError> {
        if self.max_events == 0 {
            return Ok(());
        }
        let mut events = self.events.write().unwrap();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }

    fn flush(&self) -> Result<(), JournalError> {
        Ok(())
    }
}

impl fmt::Debug for MemoryChangeSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChangeSink")
            .field("count", &self.count())
            .field("max_events", &self.max_events)
            .finish()
    }
}

/// Sink that discards everything
#[derive(Debug, Default)]
pub struct NullChangeSink;

impl ChangeSink for NullChangeSink {
    fn record(&self, _event: ChangeEvent) -> Result<(), JournalError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), JournalError> {
        Ok(())
    }
}

/// Sink that forwards to several sinks in order
#[derive(Default)]
pub struct CompositeChangeSink {
    sinks: Vec<Box<dyn ChangeSink>>,
}

impl CompositeChangeSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with_sink(mut self, sink: impl ChangeSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl ChangeSink for CompositeChangeSink {
    fn record(&self, event: ChangeEvent) -> Result<(), JournalError> {
        for sink in &self.sinks {
            sink.record(event.clone())?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), JournalError> {
        for sink in &self.sinks {
            sink.flush()?;
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.sinks.iter().all(|s| s.is_healthy())
    }
}

impl fmt::Debug for CompositeChangeSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeChangeSink")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}
