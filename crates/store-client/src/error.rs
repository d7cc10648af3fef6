//! Store client errors

use thiserror::Error;

/// Errors that can occur when talking to the object store.
///
/// The variants are a classification, not a transport detail: callers decide
/// whether to retry purely from the variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The object does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure: the resourceVersion is stale, or the
    /// object already exists on create (HTTP 409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Network or server-side unavailability (HTTP 429, 5xx, transport)
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Anything retrying cannot fix (forbidden, invalid, malformed object)
    #[error("Fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether the operation may succeed if retried later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_))
    }

    /// Classify a raw HTTP status code returned by the API server.
    #[must_use]
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            429 | 500..=599 => Self::Transient(message),
            _ => Self::Fatal(message),
        }
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) => Self::from_status(response.code, err.to_string()),
            // Connection, TLS and protocol failures never reached the API server
            other => Self::Transient(other.to_string()),
        }
    }
}
