//! Host side of the guest channel
//!
//! The server listens on a loopback TCP socket. Its bound `host:port` is the
//! channel name handed to the guest. Each connection starts with a `Hello`
//! handshake, then carries one request/response exchange at a time. Requests
//! run on the blocking pool through a fresh [`ResourceSynchronizer`], since a
//! store write may wait for its lock.

use std::net::SocketAddr;

use shimbox_api::{
    check_len, decode_body, encode_frame, FailureKind, LogLevel, NativeResultCode, Payload,
    ProtocolError, Request, Response, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::HostContext;
use crate::synchronizer::ResourceSynchronizer;

/// Error type for channel operations
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to bind channel on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel address {0} is not a loopback address")]
    NotLoopback(SocketAddr),

    #[error("Channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Notifications about guests connected to the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestEvent {
    Connected { process_id: u32 },
    /// The guest reported a fatal condition
    Critical { process_id: u32, message: String },
    Disconnected { process_id: u32 },
}

/// Loopback channel server
pub struct ChannelServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    events: Option<mpsc::UnboundedReceiver<GuestEvent>>,
    accept_task: Option<JoinHandle<()>>,
}

impl ChannelServer {
    /// Bind to `context.config.bind_address` and start accepting guests
    pub async fn bind(context: HostContext) -> Result<Self, ChannelError> {
        let address = context.config.bind_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ChannelError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        if !local_addr.ip().is_loopback() {
            return Err(ChannelError::NotLoopback(local_addr));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(listener, context, events_tx, shutdown_rx));

        tracing::info!(channel = %local_addr, "Channel listening");

        Ok(Self {
            local_addr,
            shutdown: shutdown_tx,
            events: Some(events_rx),
            accept_task: Some(accept_task),
        })
    }

    /// Name the guest uses to connect back
    pub fn channel_name(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the guest event stream; only the first call returns it
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<GuestEvent>> {
        self.events.take()
    }

    /// Stop accepting and close every open connection
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        tracing::debug!(channel = %self.local_addr, "Channel shut down");
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for ChannelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: HostContext,
    events: mpsc::UnboundedSender<GuestEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Guest connection accepted");
                    let context = context.clone();
                    let events = events.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, context, events, shutdown).await {
                            tracing::warn!(%peer, error = %e, "Guest connection ended with error");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Failed to accept guest connection"),
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    context: HostContext,
    events: mpsc::UnboundedSender<GuestEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ChannelError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let process_id = handshake(&mut reader, &mut writer).await?;
    let _ = events.send(GuestEvent::Connected { process_id });
    tracing::info!(pid = process_id, "Guest connected");

    let result = loop {
        let body = tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            body = read_body(&mut reader) => match body {
                Ok(body) => body,
                Err(ChannelError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break Ok(())
                }
                Err(e) => break Err(e),
            },
        };

        let request: Request = match decode_body(&body) {
            Ok(request) => request,
            Err(e) => {
                let response = Response::failure(FailureKind::Malformed, e.to_string());
                write_response(&mut writer, &response).await?;
                continue;
            }
        };

        let critical = match &request {
            Request::Log {
                level: LogLevel::Critical,
                message,
            } => Some(message.clone()),
            _ => None,
        };

        let synchronizer = ResourceSynchronizer::from_context(&context).for_process(process_id);
        let response = tokio::task::spawn_blocking(move || synchronizer.handle(request))
            .await
            .unwrap_or_else(|e| Response::failure(FailureKind::Internal, e.to_string()));
        write_response(&mut writer, &response).await?;

        if let Some(message) = critical {
            let _ = events.send(GuestEvent::Critical {
                process_id,
                message,
            });
        }
    };

    let _ = events.send(GuestEvent::Disconnected { process_id });
    tracing::info!(pid = process_id, "Guest disconnected");
    result
}

async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> Result<u32, ChannelError> {
    let body = read_body(reader).await?;
    let reason = match decode_body::<Request>(&body) {
        Ok(Request::Hello {
            protocol_version,
            process_id,
        }) if protocol_version == PROTOCOL_VERSION => {
            let welcome = Response::reply(
                NativeResultCode::Success,
                Payload::Welcome {
                    protocol_version: PROTOCOL_VERSION,
                },
            );
            write_response(writer, &welcome).await?;
            return Ok(process_id);
        }
        Ok(Request::Hello {
            protocol_version, ..
        }) => format!(
            "Protocol version {} not supported (host speaks {})",
            protocol_version, PROTOCOL_VERSION
        ),
        Ok(_) => "First request must be Hello".to_string(),
        Err(e) => e.to_string(),
    };

    write_response(writer, &Response::failure(FailureKind::Malformed, &reason)).await?;
    Err(ChannelError::Handshake(reason))
}

async fn read_body(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, ChannelError> {
    let len = reader.read_u32().await? as usize;
    check_len(len)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &Response,
) -> Result<(), ChannelError> {
    let frame = encode_frame(response)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
