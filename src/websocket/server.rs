use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HOST, ORIGIN};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::session::{run_session, SessionConfig, SessionOutcome};
use crate::config::Settings;
use crate::error::WebSocketError;

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Which upgrade requests are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePolicy {
    pub path: String,
    pub allow_any_origin: bool,
    /// Consulted only when `allow_any_origin` is off. A request whose origin
    /// matches its own `Host` header is always accepted.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRejection {
    UnknownPath,
    OriginNotAllowed,
}

impl UpgradeRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            UpgradeRejection::UnknownPath => StatusCode::NOT_FOUND,
            UpgradeRejection::OriginNotAllowed => StatusCode::FORBIDDEN,
        }
    }
}

impl fmt::Display for UpgradeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeRejection::UnknownPath => f.write_str("Not found"),
            UpgradeRejection::OriginNotAllowed => f.write_str("Origin not allowed"),
        }
    }
}

impl UpgradePolicy {
    pub fn check(&self, request: &Request) -> Result<(), UpgradeRejection> {
        if request.uri().path() != self.path {
            return Err(UpgradeRejection::UnknownPath);
        }
        if self.allow_any_origin {
            return Ok(());
        }

        // Clients that are not browsers usually send no Origin at all
        let Some(origin) = request.headers().get(ORIGIN).and_then(|v| v.to_str().ok()) else {
            return Ok(());
        };

        if self
            .allowed_origins
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(origin))
        {
            return Ok(());
        }

        let origin_host = origin
            .split_once("://")
            .map_or(origin, |(_, rest)| rest)
            .trim_end_matches('/');
        let same_host = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|host| host.eq_ignore_ascii_case(origin_host));

        if same_host {
            Ok(())
        } else {
            Err(UpgradeRejection::OriginNotAllowed)
        }
    }
}

/// Accepts clients and runs one echo session per connection.
pub struct WebSocketServer {
    policy: UpgradePolicy,
    session: SessionConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl WebSocketServer {
    pub fn new(settings: &Settings) -> Self {
        Self::with_config(settings.upgrade_policy(), settings.session_config())
    }

    pub fn with_config(policy: UpgradePolicy, session: SessionConfig) -> Self {
        Self {
            policy,
            session,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Perform the upgrade on `raw_stream` and run the session to completion.
    ///
    /// Returns `None` when the handshake fails or is refused.
    pub async fn handle_connection<S>(
        &self,
        raw_stream: S,
        addr: SocketAddr,
    ) -> Option<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!("New WebSocket connection from: {}", addr);

        let policy = &self.policy;
        let check_upgrade = |request: &Request, response: Response| {
            policy.check(request).map(|()| response).map_err(|rejection| {
                warn!("Rejected upgrade from {} for {}: {}", addr, request.uri(), rejection);
                let mut error = ErrorResponse::new(Some(rejection.to_string()));
                *error.status_mut() = rejection.status();
                error
            })
        };

        let ws_stream = match accept_hdr_async_with_config(
            raw_stream,
            check_upgrade,
            Some(self.session.websocket_config()),
        )
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                error!(
                    "Error during WebSocket handshake with {}: {}",
                    addr,
                    WebSocketError::Handshake(e)
                );
                return None;
            }
        };

        let outcome = run_session(
            ws_stream,
            addr.to_string(),
            self.session,
            self.shutdown.child_token(),
        )
        .await;
        info!(
            "Session {} with {} finished ({}): {} echoed, {} discarded",
            outcome.id, addr, outcome.reason, outcome.echoed, outcome.discarded
        );
        Some(outcome)
    }

    /// Accept connections from `listener` until [`shutdown`](Self::shutdown)
    /// is called, then wait for every live session to close.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        self.tracker.spawn(async move {
                            server.handle_connection(stream, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        self.accept_backoff().await;
                    }
                }
            }
        }

        self.tracker.close();
        info!("Waiting for {} connection(s) to close", self.tracker.len());
        self.tracker.wait().await;
        info!("All connections closed");
    }

    /// Wait out [`ACCEPT_ERROR_BACKOFF`], returning early on shutdown.
    async fn accept_backoff(&self) {
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
        }
    }

    /// Stop accepting and close every live session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }
}
