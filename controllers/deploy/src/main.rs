//! Deploy Controller
//!
//! Watches Deployments labelled `kube-controller=true` and injects the
//! environment variable named by their `env.inject.local` annotation into
//! every container of the pod template.
//!
//! Replicas coordinate through a Lease: all of them watch and cache, only the
//! leader reconciles.

mod backoff;
mod cache;
mod config;
mod controller;
mod error;
mod event;
mod leader;
mod metrics;
mod predicate;
mod probes;
mod queue;
mod reconciler;
mod watcher;
mod worker;

use crate::config::Config;
use crate::error::ControllerError;
use clap::Parser;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Configure rustls crypto provider before any TLS connection is made
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    let config = Config::parse();
    config.validate()?;

    info!("Starting Deploy Controller");
    info!("Configuration:");
    info!("  Leader election: {}", config.leader_elect);
    info!("  Lease: {}/{}", config.leader_namespace, config.leader_election_id);
    info!("  Workers: {}", config.workers);
    info!("  Excluded namespaces: {:?}", config.excluded_namespaces());
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
