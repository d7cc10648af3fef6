//! Reconcile keys and watch events.

use kube::Resource;
use std::fmt;
use std::sync::Arc;

/// Identifies one target object in the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    /// Namespace of the object (empty for cluster-scoped objects)
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ReconcileKey {
    /// Key for `namespace/name`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for an object; `None` when the object has no name yet.
    pub fn for_object<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone()?,
        ))
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A change observed by the watch/cache layer.
///
/// Snapshots are shared, immutable point-in-time copies.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Created(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
    /// Re-delivery of an unchanged object (periodic resync)
    Generic(Arc<K>),
}

impl<K> WatchEvent<K> {
    /// The snapshot the event is about (the new object for updates).
    pub fn object(&self) -> &K {
        match self {
            Self::Created(obj) | Self::Deleted(obj) | Self::Generic(obj) => obj,
            Self::Updated { new, .. } => new,
        }
    }

    /// Short event kind for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "create",
            Self::Updated { .. } => "update",
            Self::Deleted(_) => "delete",
            Self::Generic(_) => "generic",
        }
    }
}

impl<K: Resource> WatchEvent<K> {
    /// Reconcile key of the object the event is about.
    pub fn key(&self) -> Option<ReconcileKey> {
        ReconcileKey::for_object(self.object())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_key_display_and_derivation() {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let event = WatchEvent::Created(Arc::new(deployment));
        let key = event.key().unwrap();
        assert_eq!(key, ReconcileKey::new("shop", "web"));
        assert_eq!(key.to_string(), "shop/web");
    }

    #[test]
    fn test_unnamed_object_has_no_key() {
        let event = WatchEvent::Generic(Arc::new(Deployment::default()));
        assert!(event.key().is_none());
    }
}
