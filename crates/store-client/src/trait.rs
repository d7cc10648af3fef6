//! StoreClient trait for mocking
//!
//! This trait abstracts the StoreClient so the reconciler and the leader
//! elector can be unit tested against an in-memory store.

use crate::error::StoreError;
use crate::models::{LeaseRecord, VersionedLease};
use k8s_openapi::api::apps::v1::Deployment;

/// Trait for object store operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait StoreClientTrait: Send + Sync {
    // Workload Operations

    /// Fetch a deployment by namespace and name.
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError>;

    /// Replace a deployment. The write is conditional on the
    /// `metadata.resourceVersion` embedded in `deployment`.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;

    // Coordination Operations

    /// Fetch a lease together with its resourceVersion.
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<VersionedLease, StoreError>;
    /// Create a lease; `Conflict` if it already exists.
    async fn create_lease(&self, namespace: &str, name: &str, record: &LeaseRecord) -> Result<VersionedLease, StoreError>;
    /// Replace a lease, conditional on `resource_version`.
    async fn update_lease(&self, namespace: &str, name: &str, record: &LeaseRecord, resource_version: &str) -> Result<VersionedLease, StoreError>;
}
