//! Ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::connection::{CloseReason, ConnectionHandle};
use crate::error::WebSocketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings.
    pub probe_interval: Duration,
    /// Extra time a peer gets to answer before it is declared dead.
    pub ack_grace: Duration,
}

impl HeartbeatConfig {
    /// Longest tolerated gap between two pongs.
    pub fn deadline(&self) -> Duration {
        self.probe_interval + self.ack_grace
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            ack_grace: Duration::from_secs(3),
        }
    }
}

/// How the heartbeat loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stopped answering pings; the monitor closed the connection.
    TimedOut,
    /// A ping could not be sent; the monitor closed the connection.
    ProbeFailed,
    /// The connection was closed by someone else.
    Cancelled,
}

/// Spawn the monitor for `connection`. The returned handle must be awaited
/// by the session so the monitor never outlives it.
pub fn spawn_heartbeat(
    connection: Arc<ConnectionHandle>,
    config: HeartbeatConfig,
) -> JoinHandle<HeartbeatResult> {
    tokio::spawn(run_heartbeat(connection, config))
}

/// Probe `connection` every `probe_interval` until it closes.
///
/// On each tick the time since the last pong is checked first. Past the
/// deadline the connection is closed with [`CloseReason::LivenessTimeout`];
/// otherwise a ping is sent, and a failed send closes the connection with
/// [`CloseReason::ProbeFailed`].
pub async fn run_heartbeat(
    connection: Arc<ConnectionHandle>,
    config: HeartbeatConfig,
) -> HeartbeatResult {
    let mut ticker =
        time::interval_at(Instant::now() + config.probe_interval, config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = connection.closed() => {
                return HeartbeatResult::Cancelled;
            }
            _ = ticker.tick() => {
                let elapsed = connection.liveness().since_last_ack();
                if elapsed > config.deadline() {
                    warn!(
                        "Connection {}: {}, disconnecting",
                        connection.id(),
                        WebSocketError::LivenessTimeout(elapsed)
                    );
                    return if connection.close(CloseReason::LivenessTimeout).await {
                        HeartbeatResult::TimedOut
                    } else {
                        HeartbeatResult::Cancelled
                    };
                }

                debug!("Sending ping to connection {}", connection.id());
                match connection.send_frame(Message::Ping(Vec::new())).await {
                    Ok(()) => {}
                    Err(WebSocketError::Closed) => return HeartbeatResult::Cancelled,
                    Err(e) => {
                        warn!("Failed to send ping to connection {}: {}", connection.id(), e);
                        return if connection.close(CloseReason::ProbeFailed).await {
                            HeartbeatResult::ProbeFailed
                        } else {
                            HeartbeatResult::Cancelled
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{FrameSink, SessionState};
    use futures::channel::mpsc;
    use futures::SinkExt;
    use tokio_tungstenite::tungstenite;
    use tokio_util::sync::CancellationToken;

    fn make_connection() -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded();
        let sink: FrameSink = Box::pin(tx.sink_map_err(|_| tungstenite::Error::ConnectionClosed));
        let conn = ConnectionHandle::new(
            "hb-peer".into(),
            sink,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        (Arc::new(conn), rx)
    }

    fn config(interval_ms: u64, grace_ms: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            probe_interval: Duration::from_millis(interval_ms),
            ack_grace: Duration::from_millis(grace_ms),
        }
    }

    fn count_pings(rx: &mut mpsc::UnboundedReceiver<Message>) -> usize {
        let mut pings = 0;
        while let Ok(Some(msg)) = rx.try_next() {
            if let Message::Ping(payload) = msg {
                assert!(payload.is_empty());
                pings += 1;
            }
        }
        pings
    }

    #[test]
    fn test_default_deadline() {
        assert_eq!(HeartbeatConfig::default().deadline(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_pong() {
        let (conn, mut rx) = make_connection();
        let started = Instant::now();

        let result = run_heartbeat(conn.clone(), config(5_000, 3_000)).await;

        assert_eq!(result, HeartbeatResult::TimedOut);
        assert_eq!(conn.close_reason(), Some(CloseReason::LivenessTimeout));
        assert_eq!(conn.state(), SessionState::Closed);
        // t=5s probe sent, t=10s 10s > 8s deadline
        let closed_at = started.elapsed();
        assert!(closed_at >= Duration::from_secs(10) && closed_at < Duration::from_secs(11));
        assert_eq!(count_pings(&mut rx), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_connection_alive() {
        let (conn, mut rx) = make_connection();
        let handle = spawn_heartbeat(conn.clone(), config(5_000, 3_000));

        for _ in 0..6 {
            time::sleep(Duration::from_secs(4)).await;
            conn.mark_alive();
        }
        assert!(conn.is_open());

        conn.close(CloseReason::PeerClosed).await;
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
        assert!(count_pings(&mut rx) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_within_one_cycle_after_last_pong() {
        let (conn, _rx) = make_connection();
        let handle = spawn_heartbeat(conn.clone(), config(5_000, 3_000));

        // Last pong at t=6s, deadline at t=14s, next tick past it at t=15s
        time::sleep(Duration::from_secs(6)).await;
        conn.mark_alive();
        let last_pong = Instant::now();

        assert_eq!(handle.await.unwrap(), HeartbeatResult::TimedOut);
        let closed_after = last_pong.elapsed();
        assert!(closed_after > Duration::from_secs(8));
        assert!(closed_after <= Duration::from_secs(8) + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_closes_connection() {
        let (conn, rx) = make_connection();
        drop(rx);

        let result = run_heartbeat(conn.clone(), config(1_000, 500)).await;

        assert_eq!(result, HeartbeatResult::ProbeFailed);
        assert_eq!(conn.close_reason(), Some(CloseReason::ProbeFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_when_connection_closes() {
        let (conn, mut rx) = make_connection();
        let handle = spawn_heartbeat(conn.clone(), config(60_000, 30_000));

        time::sleep(Duration::from_millis(10)).await;
        conn.close(CloseReason::ReadFailed).await;

        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
        assert_eq!(conn.close_reason(), Some(CloseReason::ReadFailed));
        assert_eq!(count_pings(&mut rx), 0);
    }
}
