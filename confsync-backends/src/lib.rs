//! Backend store clients.
//!
//! [`StoreClient`] is the contract the sync pipeline consumes: a point-in-time
//! read of a key set, and a long-poll that resolves when any subscribed key
//! changes. Backends are selected by name through [`new_client`].
//!
//! Cancellation note: callers race the `watch_prefix` future against the
//! process-wide stop broadcast with `tokio::select!` and drop it on stop, so
//! the contract carries no stop parameter of its own. Implementations must be
//! cancel-safe at their await points.

pub mod env;
pub mod mem;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use env::EnvClient;
pub use mem::MemClient;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from backend construction and requests.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The configured backend name matched no implementation.
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// The backend's change-notification channel closed while waiting.
    #[error("backend watch channel closed")]
    WatchClosed,

    /// A backend request failed.
    #[error("backend request failed: {0}")]
    Request(String),
}

// ---------------------------------------------------------------------------
// StoreClient
// ---------------------------------------------------------------------------

/// Contract between the sync pipeline and a backend store.
#[async_trait]
pub trait StoreClient: std::fmt::Debug + Send + Sync {
    /// Point-in-time read of the given keys. Keys the backend does not hold
    /// are simply omitted from the response.
    async fn get_values(&self, keys: &[String])
        -> Result<HashMap<String, String>, BackendError>;

    /// Long-poll for changes to any of `keys` under `prefix`.
    ///
    /// `wait_index == 0` performs idempotent subscription setup and returns
    /// index `1` immediately. A nonzero index blocks until a change
    /// notification for any subscribed key arrives, then returns the new
    /// (possibly unchanged) index.
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
    ) -> Result<u64, BackendError>;
}

/// Construct the backend named in the configuration.
pub fn new_client(backend: &str, nodes: &[String]) -> Result<Arc<dyn StoreClient>, BackendError> {
    let source = if nodes.is_empty() {
        "local".to_string()
    } else {
        nodes.join(", ")
    };
    tracing::info!(backend, source = %source, "backend selected");

    match backend {
        "env" => Ok(Arc::new(EnvClient::new())),
        "mem" => Ok(Arc::new(MemClient::new())),
        other => Err(BackendError::UnknownBackend(other.to_string())),
    }
}
