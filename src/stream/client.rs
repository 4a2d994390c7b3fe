//! Low-level TCP stream client for the OCP real-time telemetry push.
//!
//! The client owns the socket inside a background worker task: it connects,
//! writes the enable-real-time handshake command, forwards the device's
//! opaque acknowledgement, then drives the blocking read loop that feeds the
//! frame reassembler and the telemetry decoder. Decoded records and
//! per-frame warnings reach the caller through a single ordered channel, so
//! the consumer never shares an execution context with the read loop.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::stream::frame::{FrameReassembler, FrameTooLarge, DEFAULT_MAX_FRAME_SIZE};
use crate::stream::proto::{self, DecodeError, TelemetryRecord};

const READ_BUFFER_SIZE: usize = 4096;

/// Device endpoint for one session. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Device host name or IP address.
    pub host: String,
    /// TCP port, 1..=65535.
    pub port: u16,
}

impl ConnectionConfig {
    /// Creates a config for the given endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1234,
        }
    }
}

/// Events produced by the stream worker, in arrival order.
#[derive(Debug)]
pub enum StreamEvent {
    /// Raw handshake reply bytes, forwarded without validation.
    HandshakeAck(Bytes),
    /// One decoded telemetry sample.
    Telemetry(TelemetryRecord),
    /// Per-frame decode problem; the stream continues.
    Warning(DecodeError),
    /// The session reached a terminal state; no further events follow.
    Terminated(TerminateReason),
}

/// Why a stream ended. `PeerClosed` and `Cancelled` are clean shutdowns,
/// not errors.
#[derive(Debug)]
pub enum TerminateReason {
    /// The device closed the connection (zero-length read).
    PeerClosed,
    /// The caller requested cancellation or dropped the connection.
    Cancelled,
    /// A terminal stream error.
    Failed(StreamClientError),
}

impl fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::Cancelled => write!(f, "cancelled by caller"),
            Self::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// Errors produced by stream transport and protocol handling. All variants
/// are terminal for the session that raised them; a new session must be
/// constructed to retry.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Connection config rejected before any socket work.
    #[error("invalid connection config: {0}")]
    Config(String),

    /// TCP connect failed.
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// Writing the handshake command failed.
    #[error("handshake command write failed: {0}")]
    HandshakeSend(#[source] std::io::Error),

    /// Reading the handshake acknowledgement failed.
    #[error("handshake read failed: {0}")]
    HandshakeRecv(#[source] std::io::Error),

    /// The device closed the connection before acknowledging the handshake.
    #[error("connection closed before handshake acknowledgement")]
    HandshakeClosed,

    /// Reassembly safety ceiling exceeded.
    #[error(transparent)]
    FrameTooLarge(#[from] FrameTooLarge),

    /// Socket read failed while streaming.
    #[error("socket read failed: {0}")]
    Read(#[source] std::io::Error),

    /// Stream worker contract error.
    #[error("stream protocol error: {0}")]
    Protocol(String),
}

/// Entry point for opening telemetry stream connections.
#[derive(Debug, Clone)]
pub struct OcpClient {
    config: ConnectionConfig,
    max_frame_size: usize,
}

impl OcpClient {
    /// Creates a client for the given device endpoint.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Overrides the reassembly safety ceiling in bytes.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Returns the configured endpoint.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Opens a stream connection and enables the real-time push.
    ///
    /// This spawns a background worker that owns the socket and returns once
    /// the worker has connected, written the handshake command, and read the
    /// device's acknowledgement. The ack is already queued on the returned
    /// connection as [`StreamEvent::HandshakeAck`] when this resolves; the
    /// ack content is opaque and never validated.
    pub async fn connect(&self) -> Result<StreamConnection, StreamClientError> {
        if self.config.port == 0 {
            return Err(StreamClientError::Config(
                "port must be in 1..=65535".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let addr = self.config.addr();
        let max_frame_size = self.max_frame_size;

        tokio::spawn(async move {
            stream_worker(addr, max_frame_size, events_tx, shutdown_rx, ready_tx).await;
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(StreamConnection {
                events: events_rx,
                shutdown: Some(shutdown_tx),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(StreamClientError::Protocol(
                "stream worker stopped before handshake completed".to_string(),
            )),
        }
    }
}

/// Active stream connection.
///
/// Events are produced by the background worker and preserved in arrival
/// order; nothing is dropped under backpressure. Dropping the connection
/// cancels the worker.
#[derive(Debug)]
pub struct StreamConnection {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl StreamConnection {
    #[cfg(test)]
    pub(crate) fn from_parts(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        shutdown: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self { events, shutdown }
    }

    /// Receives the next stream event from the worker.
    ///
    /// Returns `None` once the worker has exited and all queued events have
    /// been consumed; the last event before that is always
    /// [`StreamEvent::Terminated`].
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Requests cooperative cancellation of the read loop.
    ///
    /// The worker observes the signal between reads, emits
    /// [`StreamEvent::Terminated`] with [`TerminateReason::Cancelled`], and
    /// exits. Calling this more than once is a no-op.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn stream_worker(
    addr: String,
    max_frame_size: usize,
    events: mpsc::UnboundedSender<StreamEvent>,
    shutdown: oneshot::Receiver<()>,
    ready: oneshot::Sender<Result<(), StreamClientError>>,
) {
    let mut stream = match establish(&addr, &events).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let reason = run_streaming(&mut stream, max_frame_size, &events, shutdown).await;
    info!(event = "stream_terminated", reason = %reason);
    let _ = events.send(StreamEvent::Terminated(reason));
}

/// Connects, writes the handshake command, and forwards the opaque ack.
async fn establish(
    addr: &str,
    events: &mpsc::UnboundedSender<StreamEvent>,
) -> Result<TcpStream, StreamClientError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(StreamClientError::Connect)?;
    info!(event = "stream_connected", addr);

    let command = proto::enable_real_time_command();
    stream
        .write_all(&command)
        .await
        .map_err(StreamClientError::HandshakeSend)?;

    let mut buf = [0u8; READ_BUFFER_SIZE];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(StreamClientError::HandshakeRecv)?;
    if n == 0 {
        return Err(StreamClientError::HandshakeClosed);
    }
    debug!(event = "handshake_ack_received", len = n);
    let _ = events.send(StreamEvent::HandshakeAck(Bytes::copy_from_slice(&buf[..n])));

    Ok(stream)
}

/// Steady-state receive loop: read, reassemble, decode, forward.
async fn run_streaming(
    stream: &mut TcpStream,
    max_frame_size: usize,
    events: &mpsc::UnboundedSender<StreamEvent>,
    mut shutdown: oneshot::Receiver<()>,
) -> TerminateReason {
    let mut reassembler = FrameReassembler::with_max_frame_size(max_frame_size);
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = &mut shutdown => return TerminateReason::Cancelled,
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) => return TerminateReason::PeerClosed,
                    Ok(n) => n,
                    Err(err) => return TerminateReason::Failed(StreamClientError::Read(err)),
                };

                let frames = match reassembler.feed(&buf[..n]) {
                    Ok(frames) => frames,
                    Err(err) => return TerminateReason::Failed(err.into()),
                };

                for frame in frames {
                    let item = match proto::decode_telemetry(&frame) {
                        Ok(record) => StreamEvent::Telemetry(record),
                        Err(warning) => {
                            debug!(event = "frame_decode_warning", error = %warning);
                            StreamEvent::Warning(warning)
                        }
                    };
                    if events.send(item).is_err() {
                        // Consumer dropped the connection.
                        return TerminateReason::Cancelled;
                    }
                }
            }
        }
    }
}
