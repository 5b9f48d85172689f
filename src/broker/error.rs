//! Error taxonomy for the broker RPC client (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("request timed out")]
    Timeout,

    #[error("tls init failed: {0}")]
    TlsInit(String),

    #[error("relay table full")]
    RelayTableFull,

    #[error("unknown relay broker index {0}")]
    UnknownBroker(usize),

    #[error("client is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, BrokerError>;
