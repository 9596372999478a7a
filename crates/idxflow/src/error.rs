//! 💀 The error taxonomy — every way indexing can go sideways, with a name you can `match` on.
//!
//! Inside the backends and workers we live on `anyhow` and `.context(...)`, because
//! I/O failures are stories, not types. At the public surface the caller needs to
//! branch: "was the queue full?" is a different conversation from "the cluster
//! cannot flush". That is what this enum is for.

use std::time::Duration;

use thiserror::Error;

use crate::capabilities::{AdminOperation, BackendDistribution};
use crate::report::IndexingFailure;

#[derive(Debug, Error)]
pub enum IndexingError {
    /// 🚧 The per-index queue is at capacity and the submitter is `Rejecting`.
    #[error(
        "💀 The queue for index '{index}' is full (capacity {capacity}); the submission was rejected"
    )]
    QueueFull { index: String, capacity: usize },

    /// 🙅 The backend distribution cannot perform this administrative operation.
    #[error(
        "💀 Operation '{operation}' is not supported on this distribution ('{distribution}')"
    )]
    UnsupportedOperation {
        operation: AdminOperation,
        distribution: BackendDistribution,
    },

    /// 🚪 The executor was shut down; nobody is draining the queue anymore.
    #[error("💀 The executor for index '{index}' is closed and accepts no more work")]
    ExecutorClosed { index: String },

    /// ⏱️ An operation with an explicit deadline did not finish in time.
    #[error("💀 '{operation}' on index '{index}' did not complete within {timeout:?}")]
    Timeout {
        index: String,
        operation: AdminOperation,
        timeout: Duration,
    },

    /// 🗺️ The mapping layer was asked to index a type nobody registered.
    #[error("💀 No mapping registered for entity type '{type_name}'")]
    UnmappedEntity { type_name: &'static str },

    /// 📉 One or more documents could not be indexed.
    #[error(
        "💀 Indexing failed: {failed_count} entities could not be indexed: [{entities}]. \
         Root cause: {cause}"
    )]
    IndexingFailed {
        failed_count: usize,
        entities: String,
        #[source]
        cause: IndexingFailure,
    },

    /// 📡 The backend itself failed (network, HTTP status, closed index...).
    #[error("💀 Backend operation failed: {0:#}")]
    Backend(anyhow::Error),
}

impl From<anyhow::Error> for IndexingError {
    fn from(err: anyhow::Error) -> Self {
        IndexingError::Backend(err)
    }
}
