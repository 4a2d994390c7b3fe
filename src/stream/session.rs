//! Higher-level stream session wrapper with lifecycle state tracking.
//!
//! `StreamSession` consumes raw stream events and maintains the session
//! state machine. Exactly one session instance owns its state; terminal
//! states are final, and a new session must be constructed to retry.

use crate::stream::client::{
    OcpClient, StreamClientError, StreamConnection, StreamEvent, TerminateReason,
};

/// Session lifecycle state.
///
/// `Idle → Connecting → AwaitingHandshakeAck` happen inside
/// [`StreamSession::connect`]; a failure in those phases surfaces as the
/// `Err` of `connect` rather than as a constructed session. A live session
/// then moves `AwaitingHandshakeAck → Streaming` on the handshake ack and
/// ends in `Closed` (peer close or cancellation) or `Failed` (stream
/// error). Per-frame decode warnings never change state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No connection attempt has started.
    Idle,
    /// TCP connect in progress.
    Connecting,
    /// Handshake written; the device's acknowledgement has not been
    /// consumed yet.
    AwaitingHandshakeAck,
    /// Steady state: telemetry is flowing.
    Streaming,
    /// Terminal: peer closed the connection or the caller cancelled.
    Closed,
    /// Terminal: the stream failed.
    Failed {
        /// Rendered cause, also delivered structured via
        /// [`StreamEvent::Terminated`].
        reason: String,
    },
}

impl SessionState {
    /// Returns `true` for `Closed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed { .. })
    }
}

/// Stateful wrapper around a stream connection.
#[derive(Debug)]
pub struct StreamSession {
    connection: StreamConnection,
    state: SessionState,
}

impl StreamSession {
    /// Connects a new stream session.
    pub async fn connect(client: &OcpClient) -> Result<Self, StreamClientError> {
        let connection = client.connect().await?;
        Ok(Self::from_connection(connection))
    }

    /// Wraps an existing low-level connection.
    ///
    /// The connection's first queued event is the handshake ack, so the
    /// session starts in [`SessionState::AwaitingHandshakeAck`].
    pub fn from_connection(connection: StreamConnection) -> Self {
        Self {
            connection,
            state: SessionState::AwaitingHandshakeAck,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Receives the next stream event while tracking lifecycle state.
    ///
    /// Once the session is terminal this returns `None` forever: no
    /// telemetry or warning is ever delivered after `Closed` or `Failed`.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.state.is_terminal() {
            return None;
        }

        let Some(event) = self.connection.recv().await else {
            // Worker gone without a terminal event; treat as a clean close.
            self.state = SessionState::Closed;
            return None;
        };

        match &event {
            StreamEvent::HandshakeAck(_) => self.state = SessionState::Streaming,
            StreamEvent::Terminated(reason) => self.state = terminal_state(reason),
            StreamEvent::Telemetry(_) | StreamEvent::Warning(_) => {}
        }

        Some(event)
    }

    /// Requests cooperative cancellation of the underlying connection.
    ///
    /// The terminal [`StreamEvent::Terminated`] still arrives through
    /// [`recv`](Self::recv).
    pub fn close(&mut self) {
        self.connection.close();
    }
}

fn terminal_state(reason: &TerminateReason) -> SessionState {
    match reason {
        TerminateReason::PeerClosed | TerminateReason::Cancelled => SessionState::Closed,
        TerminateReason::Failed(err) => SessionState::Failed {
            reason: err.to_string(),
        },
    }
}
