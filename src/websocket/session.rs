//! Lifecycle of a single client connection, from handshake to close.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::{CloseReason, ConnectionHandle};
use super::heartbeat::{spawn_heartbeat, HeartbeatConfig};
use crate::codec;
use crate::error::WebSocketError;

/// Per-connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest inbound message the transport will accept.
    pub max_message_size: usize,
    /// Upper bound on writing a single frame.
    pub write_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl SessionConfig {
    /// Transport settings enforcing the inbound size limit.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.max_message_size),
            max_frame_size: Some(self.max_message_size),
            ..Default::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_size: 512,
            write_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub id: Uuid,
    pub reason: CloseReason,
    /// Messages decoded and written back.
    pub echoed: u64,
    /// Frames dropped because they did not decode.
    pub discarded: u64,
}

enum Echo {
    Sent,
    Discarded,
}

/// Run the echo protocol on an upgraded connection until it closes.
///
/// A heartbeat monitor runs alongside the read loop for the whole session
/// and is joined before this returns. `shutdown` closes the session from the
/// outside.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    peer: String,
    config: SessionConfig,
    shutdown: CancellationToken,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let connection = Arc::new(ConnectionHandle::new(
        peer,
        Box::pin(sink),
        config.write_timeout,
        shutdown,
    ));
    let id = connection.id();
    info!("WebSocket connection established with {} (id: {})", connection.peer(), id);

    let monitor = spawn_heartbeat(connection.clone(), config.heartbeat);
    let mut echoed = 0;
    let mut discarded = 0;

    let reason = loop {
        let next = tokio::select! {
            biased;
            // Closed by the monitor or the server; close() below is then a no-op
            // unless the server cancelled us.
            () = connection.closed() => break CloseReason::ServerShutdown,
            next = stream.next() => next,
        };

        let payload = match next {
            Some(Ok(Message::Binary(payload))) => payload,
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Pong(_))) => {
                debug!("Received pong from connection {}", id);
                connection.mark_alive();
                continue;
            }
            Some(Ok(Message::Ping(_))) => {
                debug!("Received ping from connection {}", id);
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                info!("Connection {} closed by peer: {:?}", id, frame);
                break CloseReason::PeerClosed;
            }
            Some(Ok(Message::Frame(_))) => continue,
            Some(Err(e)) => {
                warn!("Connection {}: {}", id, WebSocketError::TransportRead(e));
                break CloseReason::ReadFailed;
            }
            None => break CloseReason::PeerClosed,
        };

        match echo(&connection, &payload, config.max_message_size).await {
            Ok(Echo::Sent) => echoed += 1,
            Ok(Echo::Discarded) => discarded += 1,
            Err(WebSocketError::Closed) => break CloseReason::ServerShutdown,
            Err(e) => {
                warn!("Write echo failed on connection {}: {}", id, e);
                break CloseReason::WriteFailed;
            }
        }
    };

    connection.close(reason).await;

    match monitor.await {
        Ok(result) => debug!("Heartbeat for connection {} ended: {:?}", id, result),
        Err(e) => error!("Heartbeat task for connection {} failed: {}", id, e),
    }

    SessionOutcome {
        id,
        reason: connection.close_reason().unwrap_or(reason),
        echoed,
        discarded,
    }
}

/// Decode one payload and write it back as a binary frame.
async fn echo(
    connection: &ConnectionHandle,
    payload: &[u8],
    limit: usize,
) -> Result<Echo, WebSocketError> {
    let message = match codec::decode_bounded(payload, limit) {
        Ok(message) => message,
        Err(e) => {
            warn!("Failed to decode message on connection {}: {}", connection.id(), e);
            return Ok(Echo::Discarded);
        }
    };

    info!("Received message from {}: {}", message.user, message.text);

    connection
        .send_frame(Message::Binary(codec::encode(&message)))
        .await?;
    Ok(Echo::Sent)
}
