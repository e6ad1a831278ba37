//! Request/response envelopes exchanged over the guest channel
//!
//! Every guest call is one [`Request`] answered by exactly one [`Response`].
//! Semantic outcomes (a missing key, an unknown handle) are carried as a
//! [`NativeResultCode`] inside [`Response::Reply`]; [`Response::Failure`] is
//! reserved for requests the host could not carry out at all.

use serde::{Deserialize, Serialize};

use crate::value::{CreationDisposition, FileEntry, KeyHandle, NativeResultCode, VirtualValue};

/// Protocol version checked during the `Hello` handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the channel name into the guest
pub const CHANNEL_ENV_VAR: &str = "SHIMBOX_CHANNEL";

/// Environment variable carrying the interception library path into the guest
pub const LIBRARY_ENV_VAR: &str = "SHIMBOX_LIBRARY";

/// A guest-to-host request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Must be the first request on every connection
    Hello {
        protocol_version: u32,
        process_id: u32,
    },
    /// Liveness probe
    Ping,
    Registry(RegistryRequest),
    FileSystem(FileRequest),
    /// A log record from the guest, re-emitted on the host
    Log { level: LogLevel, message: String },
}

/// Operations against the virtual registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryRequest {
    IsKnownKey { handle: KeyHandle },
    OpenKey { path: String },
    CreateKey { path: String },
    DeleteKey { handle: KeyHandle },
    QueryValue { handle: KeyHandle, name: String },
    SetValue { handle: KeyHandle, value: VirtualValue },
    DeleteValue { handle: KeyHandle, name: String },
}

impl RegistryRequest {
    /// Short operation name used in logs
    pub fn operation(&self) -> &'static str {
        match self {
            Self::IsKnownKey { .. } => "is_known_key",
            Self::OpenKey { .. } => "open_key",
            Self::CreateKey { .. } => "create_key",
            Self::DeleteKey { .. } => "delete_key",
            Self::QueryValue { .. } => "query_value",
            Self::SetValue { .. } => "set_value",
            Self::DeleteValue { .. } => "delete_value",
        }
    }
}

/// Operations against the virtual file table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileRequest {
    Resolve { path: String },
    Register { entry: FileEntry },
    Remove { path: String },
}

/// Severity of a guest log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    /// Fatal for the guest: the host terminates it after logging
    Critical,
}

/// A host-to-guest response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Reply(Reply),
    Failure(Failure),
}

impl Response {
    /// Reply with a bare result code
    pub fn code(code: NativeResultCode) -> Self {
        Self::Reply(Reply {
            code,
            payload: Payload::None,
        })
    }

    /// Reply with a result code and payload
    pub fn reply(code: NativeResultCode, payload: Payload) -> Self {
        Self::Reply(Reply { code, payload })
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(Failure {
            kind,
            message: message.into(),
        })
    }
}

/// Outcome of a request the host carried out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub code: NativeResultCode,
    pub payload: Payload,
}

/// Output data accompanying a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    None,
    Welcome { protocol_version: u32 },
    Pong,
    Handle(KeyHandle),
    Path(String),
    Created {
        handle: KeyHandle,
        disposition: CreationDisposition,
    },
    Value(VirtualValue),
    File(FileEntry),
}

/// A request the host could not carry out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

/// Classification of [`Failure`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request shape was invalid; not worth retrying
    Malformed,
    /// The store's write lock could not be acquired in time; retry is allowed
    LockUnavailable,
    /// No free handle left in the store's handle range
    HandlesExhausted,
    /// Conflicting state, e.g. a path already bound to another handle
    Conflict,
    Internal,
}

impl FailureKind {
    /// Whether a caller may retry the same request later
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::LockUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = Request::Registry(RegistryRequest::SetValue {
            handle: 7,
            value: VirtualValue::dword("Count", 3),
        });
        let bytes = rmp_serde::to_vec(&request).unwrap();
        let decoded: Request = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_failure_retry_classification() {
        assert!(FailureKind::LockUnavailable.is_retryable());
        assert!(!FailureKind::Malformed.is_retryable());
        assert!(!FailureKind::HandlesExhausted.is_retryable());
    }

    #[test]
    fn test_operation_names() {
        let request = RegistryRequest::CreateKey {
            path: "Software\\App".into(),
        };
        assert_eq!(request.operation(), "create_key");
    }
}
