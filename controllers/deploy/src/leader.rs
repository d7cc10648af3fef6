//! Lease-based leader election.
//!
//! At most one replica leads at a time; only the leader runs workers. The
//! protocol follows the usual Kubernetes lease lock:
//!
//! - every write is conditional on the lease's resourceVersion, so two
//!   candidates racing for the same lease cannot both win
//! - a lease held by someone else is considered expired once it has gone
//!   unwritten for `lease_duration`, measured on this replica's monotonic
//!   clock from the moment its current resourceVersion was first observed;
//!   wall clock timestamps in the record are informational only
//! - a leader that cannot renew within `renew_deadline` steps down
//! - a leader that shuts down releases the lease so a standby takes over
//!   without waiting for expiry

use crate::error::ControllerError;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use store_client::{LeaseRecord, StoreClientTrait, StoreError, VersionedLease};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lease duration written when a leader steps down.
const RELEASED_LEASE_DURATION_SECS: i32 = 1;

/// Leader election settings.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Namespace of the Lease
    pub namespace: String,
    /// Name of the Lease
    pub name: String,
    /// Holder identity written by this replica
    pub identity: String,
    /// How long a non-renewed lease blocks other candidates
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before stepping down
    pub renew_deadline: Duration,
    /// Interval between acquire/renew attempts
    pub retry_period: Duration,
}

/// Hooks invoked on leadership transitions.
#[async_trait::async_trait]
pub trait LeadershipCallbacks: Send + Sync {
    /// Called once this replica holds the lease.
    async fn on_started_leading(&self);
    /// Called when leadership ends, by loss or shutdown.
    async fn on_stopped_leading(&self);
}

/// The lease as last seen, and when that version was first seen.
#[derive(Debug, Clone)]
struct Observed {
    lease: VersionedLease,
    since: Instant,
}

/// Campaigns for, renews and releases the leader election lease.
pub struct LeaderElector {
    store: Arc<dyn StoreClientTrait>,
    config: LeaderElectionConfig,
    observed: Mutex<Option<Observed>>,
    leading: AtomicBool,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("config", &self.config)
            .field("leading", &self.is_leader())
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Elector over the Lease named in `config`.
    pub fn new(store: Arc<dyn StoreClientTrait>, config: LeaderElectionConfig) -> Self {
        Self {
            store,
            config,
            observed: Mutex::new(None),
            leading: AtomicBool::new(false),
        }
    }

    /// Whether this replica currently leads.
    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    fn observed(&self) -> std::sync::MutexGuard<'_, Option<Observed>> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember `lease`, restarting the expiry clock only if it was written
    /// since the last observation.
    fn observe(&self, lease: &VersionedLease) {
        let mut observed = self.observed();
        match observed.as_ref() {
            Some(seen) if seen.lease.resource_version == lease.resource_version => {}
            _ => {
                *observed = Some(Observed {
                    lease: lease.clone(),
                    since: Instant::now(),
                });
            }
        }
    }

    fn observed_expired(&self) -> bool {
        self.observed().as_ref().is_none_or(|seen| {
            let duration = u64::try_from(seen.lease.record.lease_duration_seconds).unwrap_or(0);
            seen.since + Duration::from_secs(duration) <= Instant::now()
        })
    }

    fn observed_holder(&self) -> Option<String> {
        self.observed()
            .as_ref()
            .map(|seen| seen.lease.record.holder_identity.clone())
    }

    fn lease_duration_secs(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    /// One acquire-or-renew round. `Ok(true)` means this replica holds the
    /// lease afterwards; `Ok(false)` means someone else does or won the race.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut record = LeaseRecord {
            holder_identity: self.config.identity.clone(),
            lease_duration_seconds: self.lease_duration_secs(),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
        };
        let (namespace, name) = (&self.config.namespace, &self.config.name);

        let current = match self.store.get_lease(namespace, name).await {
            Ok(current) => current,
            Err(StoreError::NotFound(_)) => {
                return match self.store.create_lease(namespace, name, &record).await {
                    Ok(created) => {
                        info!(identity = %self.config.identity, "Created leader election lease");
                        self.observe(&created);
                        Ok(true)
                    }
                    Err(StoreError::Conflict(_)) => {
                        debug!("Lease was created concurrently by another candidate");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                };
            }
            Err(e) => return Err(e),
        };
        self.observe(&current);

        let holder = &current.record.holder_identity;
        let ours = *holder == self.config.identity;
        if !holder.is_empty() && !ours && !self.observed_expired() {
            debug!(%holder, "Lease is held by another replica");
            return Ok(false);
        }

        if ours {
            record.acquire_time = current.record.acquire_time;
            record.lease_transitions = current.record.lease_transitions;
        } else {
            record.lease_transitions = current.record.lease_transitions.saturating_add(1);
        }

        match self
            .store
            .update_lease(namespace, name, &record, &current.resource_version)
            .await
        {
            Ok(updated) => {
                if !ours {
                    info!(previous = %holder, identity = %self.config.identity, "Took over leader election lease");
                }
                self.observe(&updated);
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => {
                debug!("Lease changed since read, another candidate won this round");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Give the lease up so a standby can take over at once.
    pub async fn release(&self) -> Result<(), StoreError> {
        let Some(seen) = self.observed().clone() else {
            return Ok(());
        };
        if seen.lease.record.holder_identity != self.config.identity {
            return Ok(());
        }
        let now = Utc::now();
        let record = LeaseRecord {
            holder_identity: String::new(),
            lease_duration_seconds: RELEASED_LEASE_DURATION_SECS,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: seen.lease.record.lease_transitions,
        };
        let released = self
            .store
            .update_lease(&self.config.namespace, &self.config.name, &record, &seen.lease.resource_version)
            .await?;
        self.observe(&released);
        info!(identity = %self.config.identity, "Released leader election lease");
        Ok(())
    }

    /// Campaign for the lease, lead while holding it, and go back to
    /// campaigning after a loss, until `shutdown` is signalled.
    pub async fn run_with_lease(
        &self,
        callbacks: Arc<dyn LeadershipCallbacks>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        info!(
            identity = %self.config.identity,
            lease = %format!("{}/{}", self.config.namespace, self.config.name),
            "Starting leader election"
        );
        loop {
            if !self.acquire(&mut shutdown).await {
                return Ok(());
            }
            self.leading.store(true, Ordering::Release);
            info!(identity = %self.config.identity, "Became leader");
            callbacks.on_started_leading().await;

            let shutting_down = self.renew(&mut shutdown).await;

            self.leading.store(false, Ordering::Release);
            callbacks.on_stopped_leading().await;

            if shutting_down {
                if let Err(e) = self.release().await {
                    warn!(error = %e, "Failed to release leader election lease");
                }
                return Ok(());
            }
            warn!(identity = %self.config.identity, "Lost leadership, rejoining election");
        }
    }

    /// Retry until the lease is ours. Returns false on shutdown.
    async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to acquire leader election lease"),
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.retry_period) => {}
                () = stopped(shutdown) => return false,
            }
        }
    }

    /// Keep renewing. Returns true on shutdown, false when leadership is lost.
    async fn renew(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.retry_period) => {}
                () = stopped(shutdown) => return true,
            }

            match tokio::time::timeout(self.config.renew_deadline, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => last_renewal = Instant::now(),
                Ok(Ok(false)) => {
                    if let Some(holder) = self.observed_holder().filter(|h| *h != self.config.identity) {
                        info!(%holder, "Lease was taken over");
                        return false;
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "Failed to renew leader election lease"),
                Err(_) => warn!("Lease renewal timed out"),
            }

            if last_renewal.elapsed() >= self.config.renew_deadline {
                warn!(deadline = ?self.config.renew_deadline, "No successful renewal within deadline");
                return false;
            }
        }
    }
}

/// Lead without a lease until `shutdown`; used when leader election is disabled.
pub async fn run_unelected(callbacks: Arc<dyn LeadershipCallbacks>, mut shutdown: watch::Receiver<bool>) {
    info!("Leader election disabled, leading unconditionally");
    callbacks.on_started_leading().await;
    stopped(&mut shutdown).await;
    callbacks.on_stopped_leading().await;
}

/// Resolves once shutdown is signalled, or the signal sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
