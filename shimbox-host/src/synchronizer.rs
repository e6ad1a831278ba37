//! Request dispatch from the guest channel into the stores
//!
//! Each resource domain has its own synchronizer: [`RegistrySynchronizer`]
//! over the [`RegistryStore`] and [`FileSynchronizer`] over the
//! [`FileTable`]. [`ResourceSynchronizer`] routes a channel [`Request`] to
//! the right one and answers log and ping requests itself.
//!
//! Synchronizers are built per request and hold nothing but shared
//! references to the long-lived stores and journal, so dispatch never
//! depends on which call came before.
//!
//! ```text
//!   Request ──► ResourceSynchronizer ──┬─► RegistrySynchronizer ──► RegistryStore
//!                                      ├─► FileSynchronizer ─────► FileTable
//!                                      └─► log / ping
//!                                               │
//!   Response ◄── result code + payload, or Failure for StoreError
//! ```

use std::sync::Arc;

use shimbox_api::{
    CreationDisposition, FailureKind, FileRequest, LogLevel, NativeResultCode, Payload,
    RegistryRequest, Request, Response,
};

use crate::config::HostContext;
use crate::files::FileTable;
use crate::journal::{Change, ChangeEvent, ChangeSink};
use crate::registry::{RegistryStore, StoreError, StoreResult};

/// Log target used for records forwarded by the guest
pub const GUEST_LOG_TARGET: &str = "shimbox::guest";

/// Journal handle that stamps events with the calling guest
#[derive(Clone)]
struct Recorder {
    sink: Arc<dyn ChangeSink>,
    process_id: Option<u32>,
}

impl Recorder {
    fn record(&self, change: Change) {
        let mut event = ChangeEvent::new(change);
        if let Some(pid) = self.process_id {
            event = event.with_process(pid);
        }
        if let Err(e) = self.sink.record(event) {
            tracing::warn!(error = %e, "Failed to journal change");
        }
    }
}

/// Registry domain: validates registry requests and runs them on the store
#[derive(Clone)]
pub struct RegistrySynchronizer {
    store: Arc<RegistryStore>,
    recorder: Recorder,
}

impl RegistrySynchronizer {
    pub fn new(store: Arc<RegistryStore>, journal: Arc<dyn ChangeSink>) -> Self {
        Self {
            store,
            recorder: Recorder {
                sink: journal,
                process_id: None,
            },
        }
    }

    /// Attribute journaled changes to a guest process
    pub fn for_process(mut self, process_id: u32) -> Self {
        self.recorder.process_id = Some(process_id);
        self
    }

    pub fn handle(&self, request: RegistryRequest) -> Response {
        let operation = request.operation();
        self.dispatch(request)
            .unwrap_or_else(|e| failure_for(operation, e))
    }

    fn dispatch(&self, request: RegistryRequest) -> StoreResult<Response> {
        let response = match request {
            RegistryRequest::IsKnownKey { handle } => match self.store.is_known_key(handle) {
                Some(path) => Response::reply(NativeResultCode::Success, Payload::Path(path)),
                None => Response::code(NativeResultCode::InvalidHandle),
            },
            RegistryRequest::OpenKey { path } => {
                if path.is_empty() {
                    return Ok(Response::code(NativeResultCode::InvalidParameter));
                }
                match self.store.open_key(&path) {
                    Some(handle) => {
                        Response::reply(NativeResultCode::Success, Payload::Handle(handle))
                    }
                    None => Response::code(NativeResultCode::FileNotFound),
                }
            }
            RegistryRequest::CreateKey { path } => {
                if path.is_empty() {
                    return Ok(Response::code(NativeResultCode::InvalidParameter));
                }
                let (code, handle, disposition) = self.store.create_key(&path)?;
                if disposition == CreationDisposition::CreatedNew {
                    self.recorder.record(Change::KeyCreated { handle, path });
                }
                Response::reply(
                    code,
                    Payload::Created {
                        handle,
                        disposition,
                    },
                )
            }
            RegistryRequest::DeleteKey { handle } => {
                let code = self.store.delete_key(handle)?;
                if code.is_success() {
                    self.recorder.record(Change::KeyDeleted { handle });
                }
                Response::code(code)
            }
            RegistryRequest::QueryValue { handle, name } => {
                let (code, value) = self.store.query_value(handle, &name);
                Response::reply(code, Payload::Value(value))
            }
            RegistryRequest::SetValue { handle, value } => {
                let name = value.name.clone();
                let value_type = value.value_type;
                let code = self.store.set_value(handle, value)?;
                if code.is_success() {
                    self.recorder.record(Change::ValueSet {
                        handle,
                        name,
                        value_type,
                    });
                }
                Response::code(code)
            }
            RegistryRequest::DeleteValue { handle, name } => {
                let code = self.store.delete_value(handle, &name)?;
                if code.is_success() {
                    self.recorder.record(Change::ValueDeleted { handle, name });
                }
                Response::code(code)
            }
        };
        Ok(response)
    }
}

/// File domain: runs file requests on the file table
#[derive(Clone)]
pub struct FileSynchronizer {
    table: Arc<FileTable>,
    recorder: Recorder,
}

impl FileSynchronizer {
    pub fn new(table: Arc<FileTable>, journal: Arc<dyn ChangeSink>) -> Self {
        Self {
            table,
            recorder: Recorder {
                sink: journal,
                process_id: None,
            },
        }
    }

    pub fn for_process(mut self, process_id: u32) -> Self {
        self.recorder.process_id = Some(process_id);
        self
    }

    pub fn handle(&self, request: FileRequest) -> Response {
        self.dispatch(request)
            .unwrap_or_else(|e| failure_for("file_table", e))
    }

    fn dispatch(&self, request: FileRequest) -> StoreResult<Response> {
        let response = match request {
            FileRequest::Resolve { path } => match self.table.resolve(&path) {
                (code, Some(entry)) => Response::reply(code, Payload::File(entry)),
                (code, None) => Response::code(code),
            },
            FileRequest::Register { entry } => {
                let path = entry.path.clone();
                let location = entry.location.clone();
                let code = self.table.register(entry)?;
                if code.is_success() {
                    self.recorder
                        .record(Change::FileRegistered { path, location });
                }
                Response::code(code)
            }
            FileRequest::Remove { path } => {
                let code = self.table.remove(&path)?;
                if code.is_success() {
                    self.recorder.record(Change::FileRemoved { path });
                }
                Response::code(code)
            }
        };
        Ok(response)
    }
}

/// Stateless router for one guest request
#[derive(Clone)]
pub struct ResourceSynchronizer {
    registry: RegistrySynchronizer,
    files: FileSynchronizer,
    process_id: Option<u32>,
}

impl ResourceSynchronizer {
    pub fn new(
        registry: Arc<RegistryStore>,
        files: Arc<FileTable>,
        journal: Arc<dyn ChangeSink>,
    ) -> Self {
        Self {
            registry: RegistrySynchronizer::new(registry, Arc::clone(&journal)),
            files: FileSynchronizer::new(files, journal),
            process_id: None,
        }
    }

    /// Synchronizer over the stores of `context`
    pub fn from_context(context: &HostContext) -> Self {
        Self::new(
            Arc::clone(&context.registry),
            Arc::clone(&context.files),
            Arc::clone(&context.journal),
        )
    }

    /// Attribute journaled changes and forwarded logs to a guest process
    pub fn for_process(self, process_id: u32) -> Self {
        Self {
            registry: self.registry.for_process(process_id),
            files: self.files.for_process(process_id),
            process_id: Some(process_id),
        }
    }

    pub fn registry(&self) -> &RegistrySynchronizer {
        &self.registry
    }

    pub fn files(&self) -> &FileSynchronizer {
        &self.files
    }

    /// Carry out `request`
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Registry(request) => self.registry.handle(request),
            Request::FileSystem(request) => self.files.handle(request),
            Request::Log { level, message } => {
                self.forward_log(level, &message);
                Response::code(NativeResultCode::Success)
            }
            Request::Ping => Response::reply(NativeResultCode::Success, Payload::Pong),
            Request::Hello { .. } => {
                Response::failure(FailureKind::Malformed, "Handshake already completed")
            }
        }
    }

    fn forward_log(&self, level: LogLevel, message: &str) {
        let pid = self.process_id.unwrap_or_default();
        match level {
            LogLevel::Debug => tracing::debug!(target: GUEST_LOG_TARGET, pid, "{}", message),
            LogLevel::Info => tracing::info!(target: GUEST_LOG_TARGET, pid, "{}", message),
            LogLevel::Warning => tracing::warn!(target: GUEST_LOG_TARGET, pid, "{}", message),
            LogLevel::Error => tracing::error!(target: GUEST_LOG_TARGET, pid, "{}", message),
            LogLevel::Critical => {
                tracing::error!(target: GUEST_LOG_TARGET, pid, critical = true, "{}", message)
            }
        }
    }
}

impl std::fmt::Debug for ResourceSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSynchronizer")
            .field("process_id", &self.process_id)
            .finish_non_exhaustive()
    }
}

fn failure_for(operation: &str, error: StoreError) -> Response {
    let kind = match &error {
        StoreError::LockTimeout { .. } => FailureKind::LockUnavailable,
        StoreError::Handles(_) => FailureKind::HandlesExhausted,
        StoreError::PathConflict { .. } => FailureKind::Conflict,
        StoreError::ReservedHandle | StoreError::InvalidValue { .. } => FailureKind::Malformed,
    };
    tracing::debug!(operation, error = %error, "Request failed");
    Response::failure(kind, error.to_string())
}
