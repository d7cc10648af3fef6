//! Process configuration.
//!
//! Every flag can also be supplied through the environment, which is how the
//! controller is usually configured inside a pod.

use crate::error::ControllerError;
use crate::leader::LeaderElectionConfig;
use clap::Parser;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Deploy controller configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "deploy-controller", version, about = "Injects annotated env vars into labelled Deployments")]
pub struct Config {
    /// The address the metric endpoint binds to.
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// The address the probe endpoint binds to.
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Enable leader election, ensuring only one active replica writes.
    #[arg(long, env = "LEADER_ELECT", default_value_t = true, action = clap::ArgAction::Set)]
    pub leader_elect: bool,

    /// Namespace of the leader election lease.
    #[arg(long, env = "LEADER_NAMESPACE", default_value = "default")]
    pub leader_namespace: String,

    /// Name of the leader election lease.
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = "deploy-controller-leader")]
    pub leader_election_id: String,

    /// Holder identity for this replica (defaults to `<hostname>_<uuid>`).
    #[arg(long, env = "LEADER_IDENTITY")]
    pub leader_identity: Option<String>,

    /// How long a non-renewed lease blocks other replicas.
    #[arg(long, env = "LEASE_DURATION_SECS", default_value_t = 15)]
    pub lease_duration_secs: u64,

    /// How long the leader retries renewal before stepping down.
    #[arg(long, env = "RENEW_DEADLINE_SECS", default_value_t = 10)]
    pub renew_deadline_secs: u64,

    /// Interval between lease acquire/renew attempts.
    #[arg(long, env = "RETRY_PERIOD_SECS", default_value_t = 2)]
    pub retry_period_secs: u64,

    /// Number of concurrent reconcile workers.
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Namespaces whose Deployments are never reconciled.
    #[arg(long, env = "EXCLUDE_NAMESPACES", value_delimiter = ',', default_value = "kube-system,kube-public")]
    pub exclude_namespaces: Vec<String>,

    /// Only watch this namespace (defaults to all namespaces).
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Upper bound on a single reconcile.
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 30)]
    pub reconcile_timeout_secs: u64,

    /// Grace period for in-flight reconciles on shutdown or leadership loss.
    #[arg(long, env = "GRACEFUL_SHUTDOWN_SECS", default_value_t = 30)]
    pub graceful_shutdown_secs: u64,

    /// Interval at which every cached object is re-examined.
    #[arg(long, env = "RESYNC_PERIOD_SECS", default_value_t = 36_000)]
    pub resync_period_secs: u64,
}

impl Config {
    /// Reject combinations the controller cannot run with.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "--workers must be at least 1".to_string(),
            ));
        }
        if self.retry_period_secs == 0 || self.resync_period_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "--retry-period-secs and --resync-period-secs must be positive".to_string(),
            ));
        }
        if self.leader_elect && self.renew_deadline_secs >= self.lease_duration_secs {
            return Err(ControllerError::InvalidConfig(format!(
                "--renew-deadline-secs ({}) must be shorter than --lease-duration-secs ({})",
                self.renew_deadline_secs, self.lease_duration_secs
            )));
        }
        Ok(())
    }

    /// Excluded namespaces with blanks dropped.
    pub fn excluded_namespaces(&self) -> BTreeSet<String> {
        self.exclude_namespaces
            .iter()
            .map(|ns| ns.trim())
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Lease holder identity for this replica.
    pub fn identity(&self) -> String {
        self.leader_identity.clone().unwrap_or_else(|| {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "deploy-controller".to_string());
            format!("{}_{}", host, uuid::Uuid::new_v4())
        })
    }

    /// Leader election settings derived from the flags.
    pub fn leader_election(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            namespace: self.leader_namespace.clone(),
            name: self.leader_election_id.clone(),
            identity: self.identity(),
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
        }
    }

    /// Per-reconcile timeout.
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// Drain period for in-flight reconciles.
    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }

    /// Interval between cache resyncs.
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("deploy-controller").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert!(config.leader_elect);
        assert_eq!(config.leader_namespace, "default");
        assert_eq!(config.workers, 2);
        assert_eq!(
            config.excluded_namespaces().into_iter().collect::<Vec<_>>(),
            vec!["kube-public".to_string(), "kube-system".to_string()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_leader_election_can_be_disabled() {
        let config = parse(&["--leader-elect", "false", "--exclude-namespaces", "ops, ,infra"]);
        assert!(!config.leader_elect);
        assert_eq!(config.excluded_namespaces().len(), 2);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config = parse(&["--workers", "0"]);
        assert!(matches!(config.validate(), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_renew_deadline_past_lease_duration() {
        let config = parse(&["--lease-duration-secs", "10", "--renew-deadline-secs", "10"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_identity_is_used() {
        let config = parse(&["--leader-identity", "replica-a"]);
        assert_eq!(config.leader_election().identity, "replica-a");
    }
}
