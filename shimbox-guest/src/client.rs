//! Typed request helpers
//!
//! Each method sends one request and unpacks the reply into the shape the
//! native API returns, so a hook can hand the result code straight back to
//! its caller.

use shimbox_api::{
    CreationDisposition, FileEntry, FileRequest, KeyHandle, NativeResultCode, Payload,
    RegistryRequest, Reply, Request, VirtualValue,
};

use crate::{GuestCore, GuestError};

fn unexpected(reply: Reply) -> GuestError {
    GuestError::UnexpectedPayload(format!("{:?}", reply.payload))
}

/// Registry operations against the host store
#[derive(Debug, Clone, Copy)]
pub struct RegistryClient<'a> {
    core: &'a GuestCore,
}

impl<'a> RegistryClient<'a> {
    pub(crate) fn new(core: &'a GuestCore) -> Self {
        Self { core }
    }

    fn call(&self, request: RegistryRequest) -> Result<Reply, GuestError> {
        self.core.call(&Request::Registry(request))
    }

    /// Path of the key with `handle`, if it is live
    pub fn is_known_key(&self, handle: KeyHandle) -> Result<Option<String>, GuestError> {
        match self.call(RegistryRequest::IsKnownKey { handle })? {
            Reply {
                payload: Payload::Path(path),
                ..
            } => Ok(Some(path)),
            Reply {
                payload: Payload::None,
                ..
            } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Handle of the key at `path`, if it exists
    pub fn open_key(&self, path: &str) -> Result<Option<KeyHandle>, GuestError> {
        match self.call(RegistryRequest::OpenKey { path: path.into() })? {
            Reply {
                payload: Payload::Handle(handle),
                ..
            } => Ok(Some(handle)),
            Reply {
                payload: Payload::None,
                ..
            } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Open or create the key at `path`
    ///
    /// The handle and disposition are present when the code is a success.
    pub fn create_key(
        &self,
        path: &str,
    ) -> Result<(NativeResultCode, Option<(KeyHandle, CreationDisposition)>), GuestError> {
        match self.call(RegistryRequest::CreateKey { path: path.into() })? {
            Reply {
                code,
                payload:
                    Payload::Created {
                        handle,
                        disposition,
                    },
            } => Ok((code, Some((handle, disposition)))),
            Reply {
                code,
                payload: Payload::None,
            } => Ok((code, None)),
            other => Err(unexpected(other)),
        }
    }

    pub fn delete_key(&self, handle: KeyHandle) -> Result<NativeResultCode, GuestError> {
        Ok(self.call(RegistryRequest::DeleteKey { handle })?.code)
    }

    /// Value `name` of the key with `handle`; typed `Invalid` when absent
    pub fn query_value(
        &self,
        handle: KeyHandle,
        name: &str,
    ) -> Result<(NativeResultCode, VirtualValue), GuestError> {
        match self.call(RegistryRequest::QueryValue {
            handle,
            name: name.into(),
        })? {
            Reply {
                code,
                payload: Payload::Value(value),
            } => Ok((code, value)),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_value(
        &self,
        handle: KeyHandle,
        value: VirtualValue,
    ) -> Result<NativeResultCode, GuestError> {
        Ok(self.call(RegistryRequest::SetValue { handle, value })?.code)
    }

    pub fn delete_value(&self, handle: KeyHandle, name: &str) -> Result<NativeResultCode, GuestError> {
        Ok(self
            .call(RegistryRequest::DeleteValue {
                handle,
                name: name.into(),
            })?
            .code)
    }
}

/// File table operations against the host
#[derive(Debug, Clone, Copy)]
pub struct FileSystemClient<'a> {
    core: &'a GuestCore,
}

impl<'a> FileSystemClient<'a> {
    pub(crate) fn new(core: &'a GuestCore) -> Self {
        Self { core }
    }

    fn call(&self, request: FileRequest) -> Result<Reply, GuestError> {
        self.core.call(&Request::FileSystem(request))
    }

    /// Where `path` is redirected to
    pub fn resolve(&self, path: &str) -> Result<(NativeResultCode, Option<FileEntry>), GuestError> {
        match self.call(FileRequest::Resolve { path: path.into() })? {
            Reply {
                code,
                payload: Payload::File(entry),
            } => Ok((code, Some(entry))),
            Reply {
                code,
                payload: Payload::None,
            } => Ok((code, None)),
            other => Err(unexpected(other)),
        }
    }

    pub fn register(&self, entry: FileEntry) -> Result<NativeResultCode, GuestError> {
        Ok(self.call(FileRequest::Register { entry })?.code)
    }

    pub fn remove(&self, path: &str) -> Result<NativeResultCode, GuestError> {
        Ok(self.call(FileRequest::Remove { path: path.into() })?.code)
    }
}
