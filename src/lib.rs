pub mod codec;
pub mod config;
pub mod error;
pub mod websocket;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use codec::ChatMessage;
pub use websocket::{CloseReason, SessionConfig, SessionOutcome, WebSocketServer};
