//! Errors raised while configuring and coordinating workers.
//!
//! Errors coming out of a database client live in [`ClientError`].

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;

/// Invalid or incomplete test configuration.
///
/// These are fatal for whichever worker (or the whole run) encounters them during setup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A node rotation was created without any nodes.
    #[error("node list is empty")]
    EmptyNodeList,

    /// A required configuration key was not provided.
    #[error("missing required config key `{0}`")]
    MissingKey(String),

    /// Task weights that can never select a task.
    #[error("invalid task weights: {0}")]
    InvalidWeights(String),

    /// Any other value that is out of range or malformed.
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue {
        /// The offending configuration key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// The busy counter did not drop to zero within the configured time.
#[derive(Debug, Error)]
#[error("timed out after {timeout:?} waiting for {busy} busy worker(s)")]
pub struct BarrierTimeout {
    /// Number of workers still busy when the wait gave up.
    pub busy: usize,
    /// The timeout that elapsed.
    pub timeout: Duration,
}

/// Errors that end a single worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A query or connection error from the underlying client.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Invalid configuration detected during setup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The rendezvous before the measurement phase timed out.
    #[error(transparent)]
    Barrier(#[from] BarrierTimeout),

    /// The worker task panicked or was aborted.
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;
