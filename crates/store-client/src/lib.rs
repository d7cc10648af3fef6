//! Object Store Client
//!
//! Typed get/update access to the Kubernetes API server for the objects the
//! deploy controller manages (`apps/v1 Deployment`) and for the
//! `coordination.k8s.io/v1 Lease` that backs leader election.
//!
//! Every write is conditional: updates carry the `resourceVersion` that was
//! read, and the API server rejects them with `409 Conflict` when the object
//! has moved on. Failures are classified into [`StoreError`] so callers can
//! tell benign (`NotFound`), retryable (`Conflict`, `Transient`) and fatal
//! conditions apart.
//!
//! # Example
//!
//! ```no_run
//! use store_client::{StoreClient, StoreClientTrait, StoreError};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StoreClient::try_default().await?;
//!
//! let mut deployment = client.get_deployment("default", "web").await?;
//! deployment
//!     .metadata
//!     .annotations
//!     .get_or_insert_with(Default::default)
//!     .insert("example.com/touched".to_string(), "true".to_string());
//!
//! match client.update_deployment(&deployment).await {
//!     Ok(_) => {}
//!     Err(StoreError::Conflict(_)) => { /* re-fetch and try again */ }
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```

/// Kubernetes-backed client
pub mod client;
/// Error classification
pub mod error;
/// Lease data models
pub mod models;
/// Store client trait for mocking
#[path = "trait.rs"]
pub mod store_trait;
/// In-memory store for tests
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::StoreClient;
pub use error::StoreError;
pub use models::*;
pub use store_trait::StoreClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockStoreClient;
