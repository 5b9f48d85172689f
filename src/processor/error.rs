//! Error taxonomy for the request processor (spec §7).

use thiserror::Error;

/// Errors returned by [`crate::processor::RequestProcessor`] operations.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Envelope failed `jsonrpc`/`method`/`params` validation (§7 Validation).
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Input exceeded `MAX_REQUEST_BYTES` or was not valid UTF-8 (§4.4
    /// "Input contract").
    #[error("request payload rejected: {0}")]
    RejectedPayload(String),

    /// A worker could not be dispatched on the pool.
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    /// Operation attempted after the shutdown flag was set (§7 Shutdown).
    #[error("server is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, ProcessorError>;
