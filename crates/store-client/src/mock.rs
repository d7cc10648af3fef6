//! Mock StoreClient for unit testing
//!
//! In-memory versioned store with the same optimistic concurrency rules as
//! the API server: every successful write gets a fresh resourceVersion and a
//! write carrying a stale one is rejected with `Conflict`.

use crate::error::StoreError;
use crate::models::{LeaseRecord, VersionedLease};
use crate::store_trait::StoreClientTrait;
use k8s_openapi::api::apps::v1::Deployment;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

type ObjectKey = (String, String);

/// Mock StoreClient for testing
#[derive(Clone, Default)]
pub struct MockStoreClient {
    pub(crate) deployments: Arc<Mutex<HashMap<ObjectKey, Deployment>>>,
    pub(crate) leases: Arc<Mutex<HashMap<ObjectKey, VersionedLease>>>,
    // Counter for generating resource versions
    pub(crate) next_version: Arc<Mutex<u64>>,
    // Every update_deployment call as received, before any checks
    pub(crate) update_requests: Arc<Mutex<Vec<Deployment>>>,
    pub(crate) lease_writes: Arc<Mutex<Vec<(ObjectKey, LeaseRecord)>>>,
    pub(crate) get_failures: Arc<Mutex<VecDeque<StoreError>>>,
    pub(crate) update_failures: Arc<Mutex<VecDeque<StoreError>>>,
    pub(crate) get_barrier: Arc<Mutex<Option<Arc<Barrier>>>>,
}

impl std::fmt::Debug for MockStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStoreClient")
            .field("deployments", &self.deployments.lock().unwrap().len())
            .field("leases", &self.leases.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

fn key_of(deployment: &Deployment) -> ObjectKey {
    (
        deployment.metadata.namespace.clone().unwrap_or_default(),
        deployment.metadata.name.clone().unwrap_or_default(),
    )
}

impl MockStoreClient {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate next resourceVersion
    pub(crate) fn next_version(&self) -> String {
        let mut version = self.next_version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    /// Add a deployment to the mock store (for test setup).
    ///
    /// Assigns a fresh resourceVersion and defaults the generation to 1.
    pub fn add_deployment(&self, mut deployment: Deployment) -> Deployment {
        deployment.metadata.resource_version = Some(self.next_version());
        deployment.metadata.generation.get_or_insert(1);
        self.deployments
            .lock()
            .unwrap()
            .insert(key_of(&deployment), deployment.clone());
        deployment
    }

    /// Apply a write as some other actor would (bumps the resourceVersion).
    pub fn modify_deployment(&self, namespace: &str, name: &str, mutate: impl FnOnce(&mut Deployment)) {
        let version = self.next_version();
        let mut deployments = self.deployments.lock().unwrap();
        let deployment = deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap();
        mutate(deployment);
        deployment.metadata.resource_version = Some(version);
    }

    /// Remove a deployment (for test setup)
    pub fn remove_deployment(&self, namespace: &str, name: &str) {
        self.deployments
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Current stored copy of a deployment
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.deployments
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every update request received so far, including rejected ones
    pub fn update_requests(&self) -> Vec<Deployment> {
        self.update_requests.lock().unwrap().clone()
    }

    /// Make the next `get_deployment` call fail with `error`
    pub fn fail_next_get(&self, error: StoreError) {
        self.get_failures.lock().unwrap().push_back(error);
    }

    /// Make the next `update_deployment` call fail with `error`
    pub fn fail_next_update(&self, error: StoreError) {
        self.update_failures.lock().unwrap().push_back(error);
    }

    /// Hold every `get_deployment` at `barrier` after it has read the object,
    /// so concurrent readers all observe the same resourceVersion.
    pub fn hold_gets_at(&self, barrier: Arc<Barrier>) {
        *self.get_barrier.lock().unwrap() = Some(barrier);
    }

    /// Seed a lease (for test setup)
    pub fn put_lease(&self, namespace: &str, name: &str, record: LeaseRecord) -> VersionedLease {
        let versioned = VersionedLease {
            record,
            resource_version: self.next_version(),
        };
        self.leases
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), versioned.clone());
        versioned
    }

    /// Current stored copy of a lease
    pub fn lease(&self, namespace: &str, name: &str) -> Option<VersionedLease> {
        self.leases
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of successful lease creates and updates
    pub fn lease_write_count(&self) -> usize {
        self.lease_writes.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl StoreClientTrait for MockStoreClient {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        if let Some(error) = self.get_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let snapshot = self
            .deployments
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("deployments.apps \"{}\" not found", name))
            })?;
        let barrier = self.get_barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        Ok(snapshot)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.update_requests.lock().unwrap().push(deployment.clone());
        if let Some(error) = self.update_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let key = key_of(deployment);
        let version = self.next_version();
        let mut deployments = self.deployments.lock().unwrap();
        let stored = deployments.get(&key).ok_or_else(|| {
            StoreError::NotFound(format!("deployments.apps \"{}\" not found", key.1))
        })?;

        // An absent resourceVersion is an unconditional write, as on the API server
        if let Some(requested) = deployment.metadata.resource_version.as_deref() {
            if Some(requested) != stored.metadata.resource_version.as_deref() {
                return Err(StoreError::Conflict(format!(
                    "Operation cannot be fulfilled on deployments.apps \"{}\": the object has been modified; please apply your changes to the latest version and try again",
                    key.1
                )));
            }
        }

        let mut written = deployment.clone();
        let generation = stored.metadata.generation.unwrap_or(1);
        written.metadata.generation = Some(if stored.spec != deployment.spec {
            generation + 1
        } else {
            generation
        });
        written.metadata.resource_version = Some(version);
        deployments.insert(key, written.clone());
        Ok(written)
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<VersionedLease, StoreError> {
        self.lease(namespace, name).ok_or_else(|| {
            StoreError::NotFound(format!("leases.coordination.k8s.io \"{}\" not found", name))
        })
    }

    async fn create_lease(&self, namespace: &str, name: &str, record: &LeaseRecord) -> Result<VersionedLease, StoreError> {
        let key = (namespace.to_string(), name.to_string());
        let version = self.next_version();
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "leases.coordination.k8s.io \"{}\" already exists",
                name
            )));
        }
        let versioned = VersionedLease {
            record: record.clone(),
            resource_version: version,
        };
        leases.insert(key.clone(), versioned.clone());
        self.lease_writes.lock().unwrap().push((key, record.clone()));
        Ok(versioned)
    }

    async fn update_lease(&self, namespace: &str, name: &str, record: &LeaseRecord, resource_version: &str) -> Result<VersionedLease, StoreError> {
        let key = (namespace.to_string(), name.to_string());
        let version = self.next_version();
        let mut leases = self.leases.lock().unwrap();
        let stored = leases.get(&key).ok_or_else(|| {
            StoreError::NotFound(format!("leases.coordination.k8s.io \"{}\" not found", name))
        })?;
        if stored.resource_version != resource_version {
            return Err(StoreError::Conflict(format!(
                "Operation cannot be fulfilled on leases.coordination.k8s.io \"{}\": the object has been modified",
                name
            )));
        }
        let versioned = VersionedLease {
            record: record.clone(),
            resource_version: version,
        };
        leases.insert(key.clone(), versioned.clone());
        self.lease_writes.lock().unwrap().push((key, record.clone()));
        Ok(versioned)
    }
}
