//! Error taxonomy for the WebSocket fan-out server (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unknown connection id")]
    NotFound,

    #[error("server at max_connections capacity")]
    AtCapacity,

    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error("send failed: {0}")]
    Send(String),

    #[error("server is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, ServerError>;
