//! shimbox-api: Shared types for the shimbox virtualization channel
//!
//! This crate defines the protocol between the supervising host and a
//! virtualized guest process. Communication uses MessagePack serialization
//! over length-prefixed frames.

pub mod frame;
pub mod protocol;
pub mod value;

pub use frame::{
    check_len, decode_body, encode_frame, read_frame, write_frame, ProtocolError, MAX_FRAME_LEN,
};
pub use protocol::{
    Failure, FailureKind, FileRequest, LogLevel, Payload, RegistryRequest, Reply, Request,
    Response, CHANNEL_ENV_VAR, LIBRARY_ENV_VAR, PROTOCOL_VERSION,
};
pub use value::{
    CreationDisposition, FileEntry, FileKind, KeyHandle, NativeResultCode, ValueType,
    VirtualValue,
};
