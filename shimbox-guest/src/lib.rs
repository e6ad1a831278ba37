//! shimbox-guest: SDK for interception layers running inside a guest
//!
//! An interception layer redirects the guest's native registry and file
//! calls to the host. This crate provides the connection to the host
//! channel, typed request helpers and the exported entry point the injector
//! calls once the layer is loaded.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shimbox_guest::prelude::*;
//! use std::sync::Arc;
//!
//! struct RegistryHooks;
//!
//! impl Interception for RegistryHooks {
//!     fn install(core: Arc<GuestCore>) -> Result<(), GuestError> {
//!         // Install hooks that forward to core.registry()
//!         core.log(LogLevel::Info, "registry hooks installed")
//!     }
//! }
//!
//! // Generates `shimbox_guest_run`
//! export_interception!(RegistryHooks);
//! ```

pub mod client;

use std::net::TcpStream;
use std::sync::{Arc, Mutex, TryLockError};

pub use client::{FileSystemClient, RegistryClient};
pub use shimbox_api::*;

use thiserror::Error;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_interception, GuestCore, GuestError, Interception};
    pub use shimbox_api::{
        CreationDisposition, FileEntry, KeyHandle, LogLevel, NativeResultCode, ValueType,
        VirtualValue,
    };
}

/// Errors raised on the guest side of the channel
#[derive(Debug, Error)]
pub enum GuestError {
    #[error("SHIMBOX_CHANNEL is not set; the guest was not started by a shimbox host")]
    MissingChannel,

    #[error("Failed to connect to channel {channel}: {source}")]
    Connect {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Host could not carry out the request ({kind:?}): {message}")]
    Host { kind: FailureKind, message: String },

    #[error("Unexpected reply payload: {0}")]
    UnexpectedPayload(String),
}

impl GuestError {
    /// Whether repeating the request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Host { kind, .. } if kind.is_retryable())
    }
}

/// Connection from a guest to its host
#[derive(Debug)]
pub struct GuestCore {
    stream: Mutex<TcpStream>,
    channel: String,
    process_id: u32,
}

impl GuestCore {
    /// Connect to `channel` and identify as the current process
    pub fn connect(channel: &str) -> Result<Self, GuestError> {
        Self::connect_as(channel, std::process::id())
    }

    /// Connect to the channel named in the environment
    pub fn connect_from_env() -> Result<Self, GuestError> {
        let channel = std::env::var(CHANNEL_ENV_VAR).map_err(|_| GuestError::MissingChannel)?;
        Self::connect(&channel)
    }

    /// Connect and identify as `process_id`
    pub fn connect_as(channel: &str, process_id: u32) -> Result<Self, GuestError> {
        let stream = TcpStream::connect(channel).map_err(|source| GuestError::Connect {
            channel: channel.to_string(),
            source,
        })?;
        stream.set_nodelay(true).map_err(ProtocolError::from)?;

        let core = Self {
            stream: Mutex::new(stream),
            channel: channel.to_string(),
            process_id,
        };

        let hello = Request::Hello {
            protocol_version: PROTOCOL_VERSION,
            process_id,
        };
        match core.exchange(&hello)? {
            Response::Reply(Reply {
                payload: Payload::Welcome { .. },
                ..
            }) => Ok(core),
            Response::Reply(reply) => Err(GuestError::UnexpectedPayload(format!(
                "{:?}",
                reply.payload
            ))),
            Response::Failure(failure) => Err(GuestError::Handshake(failure.message)),
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Send `request` and wait for the reply
    ///
    /// A [`Response::Failure`] becomes [`GuestError::Host`].
    pub fn call(&self, request: &Request) -> Result<Reply, GuestError> {
        match self.exchange(request)? {
            Response::Reply(reply) => Ok(reply),
            Response::Failure(Failure { kind, message }) => {
                Err(GuestError::Host { kind, message })
            }
        }
    }

    /// Registry operations
    pub fn registry(&self) -> RegistryClient<'_> {
        RegistryClient::new(self)
    }

    /// File table operations
    pub fn files(&self) -> FileSystemClient<'_> {
        FileSystemClient::new(self)
    }

    /// Forward a log record to the host
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<(), GuestError> {
        self.call(&Request::Log {
            level,
            message: message.into(),
        })?;
        Ok(())
    }

    /// Whether the host still answers
    pub fn is_connected(&self) -> bool {
        matches!(
            self.call(&Request::Ping),
            Ok(Reply {
                payload: Payload::Pong,
                ..
            })
        )
    }

    /// Report panics to the host as critical records before unwinding
    ///
    /// The host terminates the guest after a critical record. A panic raised
    /// while the stream is in use goes unreported.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let core = Arc::clone(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = core.try_report_critical(format!("Guest panicked: {}", info));
            previous(info);
        }));
    }

    /// Send a critical record unless the stream is busy
    ///
    /// Never waits for the stream: the hook runs before unwinding, so a
    /// panicking thread may still hold it. Returns `Ok(false)` when busy.
    pub fn try_report_critical(&self, message: impl Into<String>) -> Result<bool, GuestError> {
        let mut stream = match self.stream.try_lock() {
            Ok(stream) => stream,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(false),
        };
        let request = Request::Log {
            level: LogLevel::Critical,
            message: message.into(),
        };
        write_frame(&mut *stream, &request)?;
        let _: Response = read_frame(&mut *stream)?;
        Ok(true)
    }

    fn exchange(&self, request: &Request) -> Result<Response, GuestError> {
        // Poisoning only records that a caller panicked after its exchange
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        write_frame(&mut *stream, request)?;
        Ok(read_frame(&mut *stream)?)
    }
}

/// Implemented by an interception layer
pub trait Interception {
    /// Install the layer's hooks; called once the channel is connected
    fn install(core: Arc<GuestCore>) -> Result<(), GuestError>;
}

/// Exit codes returned by the generated entry point
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const INSTALL_FAILED: i32 = 1;
    pub const NO_CHANNEL: i32 = 2;
}

/// Connect, install the panic hook and run `I::install`
///
/// Used by [`export_interception!`]; returns one of the [`exit_code`]s.
pub fn run<I: Interception>() -> i32 {
    let core = match GuestCore::connect_from_env() {
        Ok(core) => Arc::new(core),
        Err(_) => return exit_code::NO_CHANNEL,
    };
    core.install_panic_hook();

    match I::install(Arc::clone(&core)) {
        Ok(()) => exit_code::OK,
        Err(e) => {
            let _ = core.log(
                LogLevel::Critical,
                format!("Interception layer failed to install: {}", e),
            );
            exit_code::INSTALL_FAILED
        }
    }
}

/// Macro to export the entry point the injector calls
///
/// # Example
///
/// ```rust,ignore
/// struct Hooks;
///
/// impl Interception for Hooks {
///     fn install(core: Arc<GuestCore>) -> Result<(), GuestError> { /* ... */ }
/// }
///
/// export_interception!(Hooks);
/// ```
#[macro_export]
macro_rules! export_interception {
    ($interception:ty) => {
        #[no_mangle]
        pub extern "C" fn shimbox_guest_run() -> i32 {
            $crate::run::<$interception>()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        let error = GuestError::Host {
            kind: FailureKind::LockUnavailable,
            message: "busy".into(),
        };
        assert!(error.is_retryable());
        assert!(!GuestError::MissingChannel.is_retryable());
    }

    #[test]
    fn test_critical_report_skips_busy_stream() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let channel = listener.local_addr().unwrap().to_string();
        let core = GuestCore {
            stream: Mutex::new(TcpStream::connect(&channel).unwrap()),
            channel,
            process_id: 1,
        };

        let held = core.stream.lock().unwrap();
        assert!(!core.try_report_critical("boom").unwrap());
        drop(held);
    }

    #[test]
    fn test_connect_refused() {
        // Port 1 on loopback is not expected to be listening
        let result = GuestCore::connect_as("127.0.0.1:1", 1);
        assert!(matches!(result, Err(GuestError::Connect { .. })));
    }
}
