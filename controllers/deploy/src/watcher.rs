//! Kubernetes resource watcher.
//!
//! Turns the list-then-watch stream from `kube_runtime::watcher` into
//! create/update/delete/generic events against a local cache, filters them,
//! and feeds matching keys to the work queue of the current leader.
//!
//! The watcher runs on every replica so a standby has a warm cache the moment
//! it takes over. Only the leader attaches a queue; without one, events are
//! filtered and dropped.

use crate::cache::ObjectCache;
use crate::error::ControllerError;
use crate::event::{ReconcileKey, WatchEvent};
use crate::predicate::Predicate;
use crate::queue::WorkQueue;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube_runtime::watcher;
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Watches Deployments and routes relevant changes to the work queue.
pub struct Watcher {
    cache: ObjectCache<Deployment>,
    filter: Box<dyn Predicate<Deployment>>,
    queue: RwLock<Option<WorkQueue<ReconcileKey>>>,
    /// Keys seen since the last `Init`, while a relist is in progress
    relist: Mutex<Option<HashSet<ReconcileKey>>>,
    synced: AtomicBool,
    resync_period: Duration,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("cached", &self.cache.len())
            .field("synced", &self.is_synced())
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(filter: Box<dyn Predicate<Deployment>>, resync_period: Duration) -> Self {
        Self {
            cache: ObjectCache::default(),
            filter,
            queue: RwLock::new(None),
            relist: Mutex::new(None),
            synced: AtomicBool::new(false),
            resync_period,
        }
    }

    /// The local mirror of watched Deployments.
    pub fn cache(&self) -> &ObjectCache<Deployment> {
        &self.cache
    }

    /// Whether the initial list has completed.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Start routing matching events into `queue`, and offer every cached
    /// object to it as a fresh create so nothing that changed while this
    /// replica was idle is missed.
    pub fn attach(&self, queue: WorkQueue<ReconcileKey>) {
        *self.queue.write().unwrap_or_else(PoisonError::into_inner) = Some(queue);
        let cached = self.cache.snapshot();
        info!(objects = cached.len(), "Replaying cache into work queue");
        for obj in cached {
            self.dispatch(&WatchEvent::Created(obj));
        }
    }

    /// Stop routing events; they are filtered and dropped from now on.
    pub fn detach(&self) {
        *self.queue.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Consume a watch stream until it ends.
    ///
    /// Stream errors are logged and polling continues; the production stream
    /// is wrapped in a backoff that reconnects on its own.
    pub async fn run<S, E>(&self, stream: S) -> Result<(), ControllerError>
    where
        S: Stream<Item = Result<watcher::Event<Deployment>, E>> + Send,
        E: Display,
    {
        info!("Starting Deployment watcher");
        let mut stream = std::pin::pin!(stream);
        let mut resync = interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(e)) => warn!(error = %e, "Deployment watch error, retrying"),
                    None => {
                        return Err(ControllerError::Watch(
                            "Deployment watch stream ended".to_string(),
                        ))
                    }
                },
                _ = resync.tick() => self.resync(),
            }
        }
    }

    /// Apply one raw watch event to the cache and dispatch what it means.
    pub(crate) fn handle(&self, event: watcher::Event<Deployment>) {
        match event {
            watcher::Event::Init => {
                debug!("Deployment relist started");
                *self.relist() = Some(HashSet::new());
            }
            watcher::Event::InitApply(obj) => {
                if let Some(key) = self.apply(obj) {
                    if let Some(seen) = self.relist().as_mut() {
                        seen.insert(key);
                    }
                }
            }
            watcher::Event::InitDone => {
                let seen = self.relist().take().unwrap_or_default();
                // Objects that vanished while we were not watching
                for gone in self.cache.retain_keys(&seen) {
                    self.dispatch(&WatchEvent::Deleted(gone));
                }
                if !self.synced.swap(true, Ordering::AcqRel) {
                    info!(objects = self.cache.len(), "Deployment cache synced");
                }
            }
            watcher::Event::Apply(obj) => {
                self.apply(obj);
            }
            watcher::Event::Delete(obj) => {
                if let Some(key) = ReconcileKey::for_object(&obj) {
                    self.cache.remove(&key);
                    self.dispatch(&WatchEvent::Deleted(Arc::new(obj)));
                }
            }
        }
    }

    fn relist(&self) -> std::sync::MutexGuard<'_, Option<HashSet<ReconcileKey>>> {
        self.relist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, obj: Deployment) -> Option<ReconcileKey> {
        let key = ReconcileKey::for_object(&obj)?;
        let new = Arc::new(obj);
        let event = match self.cache.insert(key.clone(), Arc::clone(&new)) {
            None => WatchEvent::Created(new),
            Some(old) => WatchEvent::Updated { old, new },
        };
        self.dispatch(&event);
        Some(key)
    }

    /// Re-offer every cached object as a generic event.
    pub(crate) fn resync(&self) {
        let cached = self.cache.snapshot();
        debug!(objects = cached.len(), "Periodic resync");
        for obj in cached {
            self.dispatch(&WatchEvent::Generic(obj));
        }
    }

    fn dispatch(&self, event: &WatchEvent<Deployment>) {
        if !self.filter.should_enqueue(event) {
            return;
        }
        let Some(key) = event.key() else {
            return;
        };
        match self.queue.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(queue) => {
                trace!(%key, kind = event.kind(), "Enqueueing");
                queue.add(key);
            }
            None => trace!(%key, kind = event.kind(), "Not leading, dropping event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::deployment_filter;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::{BTreeMap, BTreeSet};

    fn deployment(name: &str, generation: i64) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("shop".to_string()),
                labels: Some(BTreeMap::from([(
                    "kube-controller".to_string(),
                    "true".to_string(),
                )])),
                generation: Some(generation),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn watcher() -> Watcher {
        Watcher::new(
            Box::new(deployment_filter(BTreeSet::new())),
            Duration::from_secs(3600),
        )
    }

    async fn drain(queue: &WorkQueue<ReconcileKey>) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            let key = queue.get().await.unwrap();
            queue.done(&key);
            keys.push(key.to_string());
        }
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_initial_list_enqueues_matching_objects() {
        let watcher = watcher();
        let queue = WorkQueue::default();
        watcher.attach(queue.clone());

        let events = vec![
            Ok::<_, String>(watcher::Event::Init),
            Ok(watcher::Event::InitApply(deployment("web", 1))),
            Ok(watcher::Event::InitApply(deployment("api", 1))),
            Ok(watcher::Event::InitDone),
        ];
        let result = watcher.run(futures::stream::iter(events)).await;
        assert!(matches!(result, Err(ControllerError::Watch(_))));

        assert!(watcher.is_synced());
        assert_eq!(watcher.cache().len(), 2);
        assert_eq!(drain(&queue).await, vec!["shop/api", "shop/web"]);
    }

    #[tokio::test]
    async fn test_updates_without_generation_change_are_dropped() {
        let watcher = watcher();
        let queue = WorkQueue::default();
        watcher.handle(watcher::Event::Apply(deployment("web", 1)));
        watcher.attach(queue.clone());
        assert_eq!(drain(&queue).await, vec!["shop/web"]);

        // Status-only change: same generation
        watcher.handle(watcher::Event::Apply(deployment("web", 1)));
        assert!(queue.is_empty());

        watcher.handle(watcher::Event::Apply(deployment("web", 2)));
        assert_eq!(drain(&queue).await, vec!["shop/web"]);
    }

    #[tokio::test]
    async fn test_detached_watcher_keeps_cache_but_enqueues_nothing() {
        let watcher = watcher();
        let queue = WorkQueue::default();
        watcher.attach(queue.clone());
        watcher.detach();

        watcher.handle(watcher::Event::Apply(deployment("web", 1)));
        assert!(queue.is_empty());
        assert!(watcher.cache().get(&ReconcileKey::new("shop", "web")).is_some());
    }

    #[tokio::test]
    async fn test_relist_removes_vanished_objects() {
        let watcher = watcher();
        watcher.handle(watcher::Event::Apply(deployment("web", 1)));
        watcher.handle(watcher::Event::Apply(deployment("api", 1)));

        watcher.handle(watcher::Event::Init);
        watcher.handle(watcher::Event::InitApply(deployment("web", 1)));
        watcher.handle(watcher::Event::InitDone);

        assert_eq!(watcher.cache().len(), 1);
        assert!(watcher.cache().get(&ReconcileKey::new("shop", "api")).is_none());
    }

    #[tokio::test]
    async fn test_delete_and_resync_do_not_enqueue() {
        let watcher = watcher();
        let queue = WorkQueue::default();
        watcher.handle(watcher::Event::Apply(deployment("web", 1)));
        watcher.attach(queue.clone());
        drain(&queue).await;

        watcher.resync();
        assert!(queue.is_empty());

        watcher.handle(watcher::Event::Delete(deployment("web", 1)));
        assert!(queue.is_empty());
        assert!(watcher.cache().is_empty());
    }
}
