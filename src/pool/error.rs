//! Error taxonomy for the worker pool (spec §7, kinds 1/2/3/5/6).

use thiserror::Error;

/// Errors returned by [`crate::pool::WorkerPool`] operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Unknown worker ID or attachment key (§7 Lookup).
    #[error("not found")]
    NotFound,

    /// Attachment key already registered to a worker (§7 Capacity/Validation).
    #[error("already exists")]
    AlreadyExists,

    /// Fork/exec/thread-spawn failure launching a worker (§7 Transport).
    #[error("spawn error: {0}")]
    SpawnError(String),

    /// `join` did not observe exit before the supplied timeout (§7 Timeout).
    #[error("join timed out")]
    Timeout,

    /// Operation attempted after pool teardown began (§7 Shutdown).
    #[error("pool is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, PoolError>;
