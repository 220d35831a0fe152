//! State shared between a session's read loop and its heartbeat monitor.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use futures::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::WebSocketError;

/// Write half of a WebSocket, type-erased so the heartbeat does not need to
/// know the underlying stream type.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Open,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a connection was closed. Recorded once, by whoever closed it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a Close frame or the stream ended.
    PeerClosed,
    /// Reading from the transport failed, including oversized messages.
    ReadFailed,
    /// Writing an echo failed or timed out.
    WriteFailed,
    /// No pong within the probe interval plus grace period.
    LivenessTimeout,
    /// Sending a ping failed or timed out.
    ProbeFailed,
    /// The server is stopping.
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::ReadFailed => "read failed",
            CloseReason::WriteFailed => "write failed",
            CloseReason::LivenessTimeout => "liveness timeout",
            CloseReason::ProbeFailed => "probe failed",
            CloseReason::ServerShutdown => "server shutdown",
        };
        f.write_str(s)
    }
}

/// Monotonic timestamp of the last pong, readable and writable from any task.
///
/// Stored as microseconds since the clock was created.
#[derive(Debug)]
pub struct LivenessClock {
    origin: Instant,
    last_ack_micros: AtomicU64,
}

impl LivenessClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ack_micros: AtomicU64::new(0),
        }
    }

    /// Record an acknowledgment at the current instant.
    pub fn touch(&self) {
        let micros = self.origin.elapsed().as_micros() as u64;
        self.last_ack_micros.fetch_max(micros, Ordering::AcqRel);
    }

    pub fn last_ack(&self) -> Instant {
        self.origin + Duration::from_micros(self.last_ack_micros.load(Ordering::Acquire))
    }

    pub fn since_last_ack(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_ack())
    }
}

impl Default for LivenessClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One client connection as seen by both of its tasks.
///
/// All frame writes go through [`send_frame`](Self::send_frame), which holds
/// the writer lock for the duration of a single frame.
pub struct ConnectionHandle {
    id: Uuid,
    peer: String,
    writer: Mutex<FrameSink>,
    write_timeout: Duration,
    liveness: LivenessClock,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// `shutdown` is cancelled when this connection closes; pass a child of a
    /// server-wide token to let the server close every connection at once.
    pub fn new(
        peer: String,
        writer: FrameSink,
        write_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            writer: Mutex::new(writer),
            write_timeout,
            liveness: LivenessClock::new(),
            state: AtomicU8::new(SessionState::Open as u8),
            close_reason: OnceLock::new(),
            shutdown,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn liveness(&self) -> &LivenessClock {
        &self.liveness
    }

    /// Called for every pong received from the peer.
    pub fn mark_alive(&self) {
        self.liveness.touch();
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open && !self.shutdown.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Resolves once the connection starts closing or the server shuts down.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Send one complete frame under the writer lock.
    pub async fn send_frame(&self, message: Message) -> Result<(), WebSocketError> {
        let mut writer = self.writer.lock().await;
        if !self.is_open() {
            return Err(WebSocketError::Closed);
        }

        match timeout(self.write_timeout, writer.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WebSocketError::TransportWrite(e)),
            Err(_) => Err(WebSocketError::WriteTimeout(self.write_timeout)),
        }
    }

    /// Close the connection. Only the first caller has any effect and gets
    /// `true`; concurrent and later calls return `false` immediately.
    pub async fn close(&self, reason: CloseReason) -> bool {
        if self
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let _ = self.close_reason.set(reason);
        self.shutdown.cancel();

        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Close handshake with {} incomplete: {}", self.peer, e),
            Err(_) => debug!("Close handshake with {} timed out", self.peer),
        }

        self.state.store(SessionState::Closed as u8, Ordering::Release);
        info!("Connection {} with {} closed: {}", self.id, self.peer, reason);
        true
    }
}
