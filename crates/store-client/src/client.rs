//! Kubernetes-backed store client

use crate::error::StoreError;
use crate::models::{LeaseRecord, VersionedLease};
use crate::store_trait::StoreClientTrait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

/// Store client over the Kubernetes API server.
#[derive(Clone)]
pub struct StoreClient {
    client: Client,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient").finish_non_exhaustive()
    }
}

impl StoreClient {
    /// Wrap an existing kube client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster config or the local kubeconfig.
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = Client::try_default()
            .await
            .map_err(|e| StoreError::Fatal(format!("Failed to create Kubernetes client: {}", e)))?;
        Ok(Self::new(client))
    }

    /// Access the underlying kube client (for watchers sharing the connection).
    #[must_use]
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn leases(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl StoreClientTrait for StoreClient {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        debug!(namespace, name, "GET deployment");
        Ok(self.deployments(namespace).get(name).await?)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        let (namespace, name) = match (&deployment.metadata.namespace, &deployment.metadata.name) {
            (Some(ns), Some(name)) => (ns.as_str(), name.as_str()),
            _ => {
                return Err(StoreError::Fatal(
                    "Deployment is missing namespace or name".to_string(),
                ))
            }
        };
        debug!(
            namespace,
            name,
            resource_version = deployment.metadata.resource_version.as_deref().unwrap_or(""),
            "PUT deployment"
        );
        Ok(self
            .deployments(namespace)
            .replace(name, &PostParams::default(), deployment)
            .await?)
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<VersionedLease, StoreError> {
        let lease = self.leases(namespace).get(name).await?;
        from_lease(&lease)
    }

    async fn create_lease(&self, namespace: &str, name: &str, record: &LeaseRecord) -> Result<VersionedLease, StoreError> {
        let lease = to_lease(namespace, name, record, None)?;
        let created = self.leases(namespace).create(&PostParams::default(), &lease).await?;
        from_lease(&created)
    }

    async fn update_lease(&self, namespace: &str, name: &str, record: &LeaseRecord, resource_version: &str) -> Result<VersionedLease, StoreError> {
        let lease = to_lease(namespace, name, record, Some(resource_version.to_string()))?;
        let updated = self
            .leases(namespace)
            .replace(name, &PostParams::default(), &lease)
            .await?;
        from_lease(&updated)
    }
}

fn to_lease(
    namespace: &str,
    name: &str,
    record: &LeaseRecord,
    resource_version: Option<String>,
) -> Result<Lease, StoreError> {
    Ok(Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version,
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(record.holder_identity.clone()),
            lease_duration_seconds: Some(record.lease_duration_seconds),
            acquire_time: record.acquire_time.map(to_micro_time).transpose()?,
            renew_time: record.renew_time.map(to_micro_time).transpose()?,
            lease_transitions: Some(record.lease_transitions),
            ..Default::default()
        }),
    })
}

fn from_lease(lease: &Lease) -> Result<VersionedLease, StoreError> {
    let resource_version = lease
        .metadata
        .resource_version
        .clone()
        .ok_or_else(|| StoreError::Fatal("Lease has no resourceVersion".to_string()))?;
    let record = lease
        .spec
        .as_ref()
        .map(|spec| LeaseRecord {
            holder_identity: spec.holder_identity.clone().unwrap_or_default(),
            lease_duration_seconds: spec.lease_duration_seconds.unwrap_or_default(),
            acquire_time: spec.acquire_time.as_ref().and_then(from_micro_time),
            renew_time: spec.renew_time.as_ref().and_then(from_micro_time),
            lease_transitions: spec.lease_transitions.unwrap_or_default(),
        })
        .unwrap_or_default();
    Ok(VersionedLease {
        record,
        resource_version,
    })
}

// MicroTime is converted through its RFC 3339 wire form so this crate does not
// depend on which time library k8s-openapi wraps.
fn to_micro_time(ts: DateTime<Utc>) -> Result<MicroTime, StoreError> {
    let wire = serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true));
    serde_json::from_value(wire)
        .map_err(|e| StoreError::Fatal(format!("Invalid lease timestamp {}: {}", ts, e)))
}

fn from_micro_time(time: &MicroTime) -> Option<DateTime<Utc>> {
    let wire = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(wire.as_str()?)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_lease_conversion_keeps_record() {
        let record = LeaseRecord {
            holder_identity: "replica-a".to_string(),
            lease_duration_seconds: 15,
            acquire_time: Some(Utc.with_ymd_and_hms(2024, 8, 20, 15, 47, 0).unwrap()),
            renew_time: Some(Utc.with_ymd_and_hms(2024, 8, 20, 15, 47, 10).unwrap()),
            lease_transitions: 3,
        };

        let mut lease = to_lease("kube-system", "deploy-controller-leader", &record, None).unwrap();
        assert!(lease.metadata.resource_version.is_none());
        lease.metadata.resource_version = Some("42".to_string());

        let versioned = from_lease(&lease).unwrap();
        assert_eq!(versioned.resource_version, "42");
        assert_eq!(versioned.record, record);
    }

    #[test]
    fn test_lease_without_resource_version_is_rejected() {
        let lease = to_lease("default", "leader", &LeaseRecord::default(), None).unwrap();
        assert!(matches!(from_lease(&lease), Err(StoreError::Fatal(_))));
    }
}
