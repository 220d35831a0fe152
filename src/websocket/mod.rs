//! WebSocket module for the chat relay
//!
//! This module accepts WebSocket upgrades, runs the echo session for each
//! client and watches every connection with a ping/pong heartbeat.

mod connection;
mod heartbeat;
mod server;
mod session;

pub use connection::{CloseReason, ConnectionHandle, FrameSink, LivenessClock, SessionState};
pub use heartbeat::{run_heartbeat, spawn_heartbeat, HeartbeatConfig, HeartbeatResult};
pub use server::{UpgradePolicy, UpgradeRejection, WebSocketServer};
pub use session::{run_session, SessionConfig, SessionOutcome};
