use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] WebSocketError),

    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

// Add conversion from std::io::Error
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

/// Failure to turn a binary payload into a chat message.
///
/// Always recoverable: the offending frame is dropped and the connection
/// stays open.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed chat message: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("Payload of {len} bytes exceeds limit of {limit} bytes")]
    TooLarge { len: usize, limit: usize },
}

/// Transport-level failures. Everything except `Handshake` ends the session
/// it happened on and nothing else.
#[derive(Error, Debug)]
pub enum WebSocketError {
    #[error("Handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("Read failed: {0}")]
    TransportRead(#[source] tungstenite::Error),

    #[error("Write failed: {0}")]
    TransportWrite(#[source] tungstenite::Error),

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("No pong received for {0:?}")]
    LivenessTimeout(Duration),

    #[error("Connection already closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_conversion() {
        // Test IO error conversion
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::InternalError(_)));

        // Test config error conversion
        let config_err = config::ConfigError::NotFound(String::from("key not found"));
        let app_err: AppError = config_err.into();
        assert!(matches!(app_err, AppError::ConfigError(_)));

        // Test websocket error conversion
        let app_err: AppError = WebSocketError::Closed.into();
        assert!(matches!(app_err, AppError::WebSocketError(WebSocketError::Closed)));
    }

    #[test]
    fn test_decode_error_from_prost() {
        let err = <crate::codec::ChatMessage as prost::Message>::decode(&[0xff_u8][..])
            .expect_err("truncated varint must not decode");
        let decode_err: DecodeError = err.into();
        assert!(matches!(decode_err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_error_display() {
        let err = DecodeError::TooLarge { len: 600, limit: 512 };
        assert_eq!(err.to_string(), "Payload of 600 bytes exceeds limit of 512 bytes");

        let err = AppError::ConfigError("missing port".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing port");

        let err = AppError::WebSocketError(WebSocketError::LivenessTimeout(Duration::from_secs(8)));
        assert_eq!(err.to_string(), "WebSocket error: No pong received for 8s");
    }
}
