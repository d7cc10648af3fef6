//! Prometheus metrics for the deploy controller.
//!
//! Metrics live in a registry owned by the controller rather than the
//! process-global one, so tests can build as many as they like.

use crate::error::ControllerError;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Reconcile outcome label values.
pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_REQUEUE: &str = "requeue";
pub const RESULT_ERROR: &str = "error";

/// Controller metrics and the registry they are exported from.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    reconcile_duration: HistogramVec,
    leader: IntGauge,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("leader", &self.leader.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register all controller metrics.
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new("deploy_controller_reconcile_total", "Total number of reconciliations"),
            &["result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "deploy_controller_reconcile_duration_seconds",
                "Duration of reconciliation in seconds",
            ),
            &["result"],
        )?;
        let leader = IntGauge::new(
            "deploy_controller_leader",
            "Whether this instance is the leader (1=leader, 0=standby)",
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(leader.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            reconcile_duration,
            leader,
        })
    }

    /// Record a completed reconciliation.
    pub fn record_reconcile(&self, result: &str, elapsed: Duration) {
        self.reconciles.with_label_values(&[result]).inc();
        self.reconcile_duration
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
    }

    /// Reconciles recorded so far with the given result.
    pub fn reconcile_count(&self, result: &str) -> u64 {
        self.reconciles.with_label_values(&[result]).get()
    }

    /// Update the leader gauge.
    pub fn set_leader(&self, is_leader: bool) {
        self.leader.set(i64::from(is_leader));
    }

    /// Current value of the leader gauge.
    pub fn is_leader(&self) -> bool {
        self.leader.get() == 1
    }

    /// Encode all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Probe(format!("metrics are not UTF-8: {e}")))
    }
}
