//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the watcher,
//! leader election, the worker pool and the probe servers together.
//!
//! Every replica watches and caches Deployments. Only the replica holding the
//! lease runs workers: on acquiring it, a fresh queue and pool are started and
//! the queue is attached to the watcher; on losing it, the queue is detached
//! and the pool is drained.

use crate::config::Config;
use crate::error::ControllerError;
use crate::leader::{run_unelected, LeaderElector, LeadershipCallbacks};
use crate::metrics::Metrics;
use crate::predicate::deployment_filter;
use crate::probes::{self, metrics_router, probe_router, ProbeState};
use crate::queue::WorkQueue;
use crate::reconciler::{Reconcile, Reconciler};
use crate::watcher::Watcher;
use crate::worker::WorkerPool;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use kube_runtime::{watcher, WatchStreamExt};
use std::sync::Arc;
use std::time::Duration;
use store_client::{StoreClient, StoreClientTrait};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Starts and stops the worker pool as leadership comes and goes.
pub struct Workload {
    watcher: Arc<Watcher>,
    reconciler: Arc<dyn Reconcile>,
    metrics: Metrics,
    workers: usize,
    reconcile_timeout: Duration,
    grace: Duration,
    pool: Mutex<Option<WorkerPool>>,
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workload")
            .field("workers", &self.workers)
            .field("reconcile_timeout", &self.reconcile_timeout)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl Workload {
    /// Workload over the shared watcher; queues and pools are created per term.
    pub fn new(
        watcher: Arc<Watcher>,
        reconciler: Arc<dyn Reconcile>,
        metrics: Metrics,
        workers: usize,
        reconcile_timeout: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            watcher,
            reconciler,
            metrics,
            workers,
            reconcile_timeout,
            grace,
            pool: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl LeadershipCallbacks for Workload {
    async fn on_started_leading(&self) {
        let queue = WorkQueue::default();
        let pool = WorkerPool::start(
            queue.clone(),
            Arc::clone(&self.reconciler),
            self.workers,
            self.reconcile_timeout,
            self.metrics.clone(),
        );
        *self.pool.lock().await = Some(pool);
        self.watcher.attach(queue);
        self.metrics.set_leader(true);
    }

    async fn on_stopped_leading(&self) {
        self.watcher.detach();
        self.metrics.set_leader(false);
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.stop(self.grace).await;
        }
    }
}

/// Main controller for Deployment env injection.
pub struct Controller {
    config: Config,
    client: Client,
    watcher: Arc<Watcher>,
    metrics: Metrics,
    workload: Arc<Workload>,
    elector: Option<LeaderElector>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("elector", &self.elector)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing Deploy Controller");

        // Create Kubernetes client
        let store_client = StoreClient::try_default().await?;
        let client = store_client.kube_client();
        let store: Arc<dyn StoreClientTrait> = Arc::new(store_client);

        let metrics = Metrics::new()?;
        let watcher = Arc::new(Watcher::new(
            Box::new(deployment_filter::<Deployment>(config.excluded_namespaces())),
            config.resync_period(),
        ));
        let reconciler: Arc<dyn Reconcile> = Arc::new(Reconciler::new(Arc::clone(&store)));
        let workload = Arc::new(Workload::new(
            Arc::clone(&watcher),
            reconciler,
            metrics.clone(),
            config.workers,
            config.reconcile_timeout(),
            config.graceful_shutdown(),
        ));
        let elector = config
            .leader_elect
            .then(|| LeaderElector::new(store, config.leader_election()));

        Ok(Self {
            config,
            client,
            watcher,
            metrics,
            workload,
            elector,
        })
    }

    /// Runs the controller until SIGINT/SIGTERM or a fatal watch failure.
    pub async fn run(self) -> Result<(), ControllerError> {
        let (stop, shutdown) = watch::channel(false);
        let stop = Arc::new(stop);

        // Bind first so a taken port fails startup
        let probe_listener = probes::bind(self.config.health_probe_bind_address).await?;
        let metrics_listener = probes::bind(self.config.metrics_bind_address).await?;
        let probe_server = tokio::spawn(probes::serve(
            probe_listener,
            probe_router(ProbeState::new(Arc::clone(&self.watcher))),
            shutdown.clone(),
        ));
        let metrics_server = tokio::spawn(probes::serve(
            metrics_listener,
            metrics_router(self.metrics.clone()),
            shutdown.clone(),
        ));

        let api: Api<Deployment> = match self.config.watch_namespace.as_deref() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        info!(
            namespace = self.config.watch_namespace.as_deref().unwrap_or("all namespaces"),
            "Watching Deployments"
        );
        let watch_task = {
            let watcher = Arc::clone(&self.watcher);
            let stop = Arc::clone(&stop);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
                let result = tokio::select! {
                    result = watcher.run(stream) => result,
                    _ = shutdown.wait_for(|stop| *stop) => Ok(()),
                };
                if let Err(e) = &result {
                    error!(error = %e, "Deployment watcher failed, shutting down");
                    stop.send_replace(true);
                }
                result
            })
        };

        {
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutdown signal received");
                stop.send_replace(true);
            });
        }

        let callbacks: Arc<dyn LeadershipCallbacks> = self.workload.clone();
        match &self.elector {
            Some(elector) => elector.run_with_lease(callbacks, shutdown.clone()).await?,
            None => run_unelected(callbacks, shutdown.clone()).await,
        }

        stop.send_replace(true);
        for (name, server) in [("probe", probe_server), ("metrics", metrics_server)] {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(server = name, error = %e, "HTTP server exited with error"),
                Err(e) => warn!(server = name, error = %e, "HTTP server task failed"),
            }
        }
        let watched = watch_task
            .await
            .map_err(|e| ControllerError::Watch(format!("Deployment watcher panicked: {}", e)))?;

        info!("Deploy Controller stopped");
        watched
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::LeaderElectionConfig;
    use crate::reconciler::INJECT_ANNOTATION;
    use chrono::Utc;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::{BTreeMap, BTreeSet};
    use store_client::{LeaseRecord, MockStoreClient};

    fn deployment() -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                labels: Some(BTreeMap::from([("kube-controller".to_string(), "true".to_string())])),
                annotations: Some(BTreeMap::from([(INJECT_ANNOTATION.to_string(), "RUN_ON__prod".to_string())])),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn setup(store: &MockStoreClient) -> (Arc<Watcher>, Arc<Workload>, Metrics) {
        let watcher = Arc::new(Watcher::new(
            Box::new(deployment_filter::<Deployment>(BTreeSet::new())),
            Duration::from_secs(3600),
        ));
        let metrics = Metrics::new().unwrap();
        let reconciler: Arc<dyn Reconcile> = Arc::new(Reconciler::new(Arc::new(store.clone())));
        let workload = Arc::new(Workload::new(
            Arc::clone(&watcher),
            reconciler,
            metrics.clone(),
            2,
            Duration::from_secs(30),
            Duration::from_secs(5),
        ));
        (watcher, workload, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_does_not_write_until_it_leads() {
        let store = MockStoreClient::new();
        let stored = store.add_deployment(deployment());
        store.put_lease(
            "default",
            "deploy-controller-leader",
            LeaseRecord {
                holder_identity: "other".to_string(),
                lease_duration_seconds: 15,
                acquire_time: Some(Utc::now()),
                renew_time: Some(Utc::now()),
                lease_transitions: 0,
            },
        );
        let (watcher, workload, metrics) = setup(&store);
        let elector = Arc::new(LeaderElector::new(
            Arc::new(store.clone()),
            LeaderElectionConfig {
                namespace: "default".to_string(),
                name: "deploy-controller-leader".to_string(),
                identity: "me".to_string(),
                lease_duration: Duration::from_secs(15),
                renew_deadline: Duration::from_secs(10),
                retry_period: Duration::from_secs(2),
            },
        ));
        let (stop, shutdown) = watch::channel(false);
        let run = {
            let elector = Arc::clone(&elector);
            let callbacks: Arc<dyn LeadershipCallbacks> = workload.clone();
            tokio::spawn(async move { elector.run_with_lease(callbacks, shutdown).await })
        };

        // Matching events arrive while another replica holds the lease
        watcher.handle(watcher::Event::Init);
        watcher.handle(watcher::Event::InitApply(stored));
        watcher.handle(watcher::Event::InitDone);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(store.update_requests().is_empty());
        assert!(!metrics.is_leader());

        // The other holder never renews: after expiry this replica takes over
        // and the cached Deployment is reconciled
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(metrics.is_leader());
        assert_eq!(store.update_requests().len(), 1);
        let env = store.deployment("shop", "web").unwrap().spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        assert_eq!(env[0].name, "RUN_ON");

        stop.send(true).unwrap();
        run.await.unwrap().unwrap();
        assert!(!metrics.is_leader());
        assert_eq!(store.lease("default", "deploy-controller-leader").unwrap().record.holder_identity, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unelected_workload_reconciles_events() {
        let store = MockStoreClient::new();
        let stored = store.add_deployment(deployment());
        let (watcher, workload, metrics) = setup(&store);
        let (stop, shutdown) = watch::channel(false);
        let run = {
            let callbacks: Arc<dyn LeadershipCallbacks> = workload.clone();
            tokio::spawn(run_unelected(callbacks, shutdown))
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(metrics.is_leader());

        watcher.handle(watcher::Event::Apply(stored));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.update_requests().len(), 1);
        assert_eq!(metrics.reconcile_count(crate::metrics::RESULT_SUCCESS), 1);

        stop.send(true).unwrap();
        run.await.unwrap();
        assert!(!metrics.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_after_losing_leadership_are_dropped() {
        let store = MockStoreClient::new();
        let stored = store.add_deployment(deployment());
        let (watcher, workload, _metrics) = setup(&store);

        workload.on_started_leading().await;
        workload.on_stopped_leading().await;

        watcher.handle(watcher::Event::Apply(stored));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.update_requests().is_empty());
    }
}
