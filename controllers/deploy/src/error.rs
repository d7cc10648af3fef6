//! Controller-specific error types.
//!
//! This module defines the errors the deploy controller surfaces, on top of
//! the classified store errors from `store-client`.

use std::time::Duration;
use store_client::StoreError;
use thiserror::Error;

/// Errors that can occur in the deploy controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Object store error (not found, conflict, transient, fatal)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Domain data on the object cannot be acted upon; retrying will not help
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The reconcile task panicked
    #[error("Reconcile panicked: {0}")]
    Panicked(String),

    /// The reconcile task did not finish in time
    #[error("Reconcile timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Health probe or metrics server failure
    #[error("Probe server error: {0}")]
    Probe(String),

    /// Metrics registry failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ControllerError {
    /// Whether a reconcile that failed with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Panicked(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }
}
