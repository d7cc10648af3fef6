//! Event filters deciding which watch events become reconcile work.
//!
//! Filters are pure: no I/O, no shared state, bounded time. They run inline
//! on the watch dispatch path. The controller composes its filter as
//! `AllOf[LabelSelectorPredicate, GenerationChangedPredicate]`.

use crate::event::WatchEvent;
use kube::Resource;
use std::collections::BTreeSet;

/// Label that opts a Deployment into reconciliation.
pub const SELECTOR_LABEL: &str = "kube-controller";
/// Value the selector label must carry.
pub const SELECTOR_SENTINEL: &str = "true";

/// A pure boolean decision over a watch event.
pub trait Predicate<K>: Send + Sync {
    fn should_enqueue(&self, event: &WatchEvent<K>) -> bool;
}

/// Namespace exclusion plus opt-in label check.
///
/// - creates pass when the namespace is not excluded and the label equals the sentinel
/// - updates pass when the namespace is not excluded and the new object's label equals the sentinel
/// - deletes and generic events never pass
#[derive(Debug, Clone)]
pub struct LabelSelectorPredicate {
    excluded_namespaces: BTreeSet<String>,
    label_key: String,
    sentinel: String,
}

impl LabelSelectorPredicate {
    /// Selector on `label_key=sentinel` outside `excluded_namespaces`.
    pub fn new(
        excluded_namespaces: BTreeSet<String>,
        label_key: impl Into<String>,
        sentinel: impl Into<String>,
    ) -> Self {
        Self {
            excluded_namespaces,
            label_key: label_key.into(),
            sentinel: sentinel.into(),
        }
    }

    /// The controller's selector: `kube-controller=true` outside `excluded_namespaces`.
    pub fn opted_in(excluded_namespaces: BTreeSet<String>) -> Self {
        Self::new(excluded_namespaces, SELECTOR_LABEL, SELECTOR_SENTINEL)
    }

    fn is_excluded<K: Resource>(&self, obj: &K) -> bool {
        obj.meta()
            .namespace
            .as_ref()
            .is_some_and(|ns| self.excluded_namespaces.contains(ns))
    }

    fn has_sentinel<K: Resource>(&self, obj: &K) -> bool {
        obj.meta()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.label_key))
            .is_some_and(|value| *value == self.sentinel)
    }
}

impl<K: Resource> Predicate<K> for LabelSelectorPredicate {
    fn should_enqueue(&self, event: &WatchEvent<K>) -> bool {
        match event {
            WatchEvent::Created(obj) => !self.is_excluded(obj.as_ref()) && self.has_sentinel(obj.as_ref()),
            // Namespace is immutable, old and new agree
            WatchEvent::Updated { old, new } => {
                !self.is_excluded(old.as_ref()) && self.has_sentinel(new.as_ref())
            }
            WatchEvent::Deleted(_) | WatchEvent::Generic(_) => false,
        }
    }
}

/// Passes updates only when `metadata.generation` changed, dropping
/// status-only and metadata-only updates. Other event kinds pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationChangedPredicate;

impl<K: Resource> Predicate<K> for GenerationChangedPredicate {
    fn should_enqueue(&self, event: &WatchEvent<K>) -> bool {
        match event {
            WatchEvent::Updated { old, new } => {
                match (old.meta().generation, new.meta().generation) {
                    (Some(old_gen), Some(new_gen)) => old_gen != new_gen,
                    _ => false,
                }
            }
            _ => true,
        }
    }
}

/// Ordered AND of filters, short-circuiting on the first rejection.
pub struct AllOf<K> {
    filters: Vec<Box<dyn Predicate<K>>>,
}

impl<K> AllOf<K> {
    /// Combine `filters`, evaluated in order.
    pub fn new(filters: Vec<Box<dyn Predicate<K>>>) -> Self {
        Self { filters }
    }
}

impl<K> std::fmt::Debug for AllOf<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllOf").field("filters", &self.filters.len()).finish()
    }
}

impl<K> Predicate<K> for AllOf<K> {
    fn should_enqueue(&self, event: &WatchEvent<K>) -> bool {
        self.filters.iter().all(|filter| filter.should_enqueue(event))
    }
}

/// The filter chain used by the controller.
pub fn deployment_filter<K: Resource + 'static>(excluded_namespaces: BTreeSet<String>) -> AllOf<K> {
    AllOf::new(vec![
        Box::new(LabelSelectorPredicate::opted_in(excluded_namespaces)),
        Box::new(GenerationChangedPredicate),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn deployment(namespace: &str, label: Option<&str>, generation: i64) -> Arc<Deployment> {
        let labels = label.map(|value| {
            BTreeMap::from([(SELECTOR_LABEL.to_string(), value.to_string())])
        });
        Arc::new(Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some(namespace.to_string()),
                labels,
                generation: Some(generation),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn filter() -> AllOf<Deployment> {
        deployment_filter(BTreeSet::from([
            "kube-system".to_string(),
            "kube-public".to_string(),
        ]))
    }

    #[test]
    fn test_create_requires_sentinel_label() {
        let filter = filter();
        assert!(filter.should_enqueue(&WatchEvent::Created(deployment("shop", Some("true"), 1))));
        assert!(!filter.should_enqueue(&WatchEvent::Created(deployment("shop", Some("false"), 1))));
        assert!(!filter.should_enqueue(&WatchEvent::Created(deployment("shop", Some("TRUE"), 1))));
        assert!(!filter.should_enqueue(&WatchEvent::Created(deployment("shop", None, 1))));
    }

    #[test]
    fn test_excluded_namespace_is_rejected() {
        let filter = filter();
        assert!(!filter.should_enqueue(&WatchEvent::Created(deployment("kube-system", Some("true"), 1))));
        assert!(!filter.should_enqueue(&WatchEvent::Updated {
            old: deployment("kube-public", Some("true"), 1),
            new: deployment("kube-public", Some("true"), 2),
        }));
    }

    #[test]
    fn test_update_requires_generation_change() {
        let filter = filter();
        assert!(filter.should_enqueue(&WatchEvent::Updated {
            old: deployment("shop", Some("true"), 1),
            new: deployment("shop", Some("true"), 2),
        }));
        assert!(!filter.should_enqueue(&WatchEvent::Updated {
            old: deployment("shop", Some("true"), 3),
            new: deployment("shop", Some("true"), 3),
        }));
    }

    #[test]
    fn test_update_checks_label_on_new_object() {
        let filter = filter();
        assert!(filter.should_enqueue(&WatchEvent::Updated {
            old: deployment("shop", None, 1),
            new: deployment("shop", Some("true"), 2),
        }));
        assert!(!filter.should_enqueue(&WatchEvent::Updated {
            old: deployment("shop", Some("true"), 1),
            new: deployment("shop", Some("false"), 2),
        }));
    }

    #[test]
    fn test_delete_and_generic_never_enqueue() {
        let filter = filter();
        assert!(!filter.should_enqueue(&WatchEvent::Deleted(deployment("shop", Some("true"), 1))));
        assert!(!filter.should_enqueue(&WatchEvent::Generic(deployment("shop", Some("true"), 1))));
    }

    #[test]
    fn test_generation_predicate_alone() {
        let predicate = GenerationChangedPredicate;
        let obj = deployment("shop", None, 1);
        assert!(Predicate::<Deployment>::should_enqueue(&predicate, &WatchEvent::Created(obj.clone())));
        assert!(Predicate::<Deployment>::should_enqueue(&predicate, &WatchEvent::Deleted(obj.clone())));
        assert!(!Predicate::<Deployment>::should_enqueue(
            &predicate,
            &WatchEvent::Updated { old: obj.clone(), new: obj },
        ));
    }

    #[test]
    fn test_empty_chain_accepts() {
        let chain: AllOf<Deployment> = AllOf::new(Vec::new());
        assert!(chain.should_enqueue(&WatchEvent::Deleted(deployment("shop", None, 1))));
    }
}
