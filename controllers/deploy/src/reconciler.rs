//! Reconciliation logic for Deployments.
//!
//! A Deployment opts in with the `kube-controller=true` label and asks for an
//! environment variable through the `env.inject.local` annotation, written as
//! `NAME__value`. Every container of the pod template must then carry
//! `NAME=value`.
//!
//! Reconciliation is level-triggered: each call re-reads the object and
//! derives the whole desired state from it. Nothing is remembered between
//! calls, and applying the same state twice writes nothing the second time.

use crate::error::ControllerError;
use crate::event::ReconcileKey;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::EnvVar;
use std::sync::Arc;
use std::time::Duration;
use store_client::{StoreClientTrait, StoreError};
use tracing::{debug, info, warn};

/// Annotation carrying the variable to inject.
pub const INJECT_ANNOTATION: &str = "env.inject.local";
/// Separator between variable name and value in the annotation.
pub const INJECT_SEPARATOR: &str = "__";
/// Annotation marking Deployments this controller has written to.
pub const MANAGED_ANNOTATION: &str = "kube-controller";
/// Value of the managed-by annotation.
pub const MANAGED_VALUE: &str = "managed";

/// What the worker should do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing further to do until the object changes again.
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    /// Reconcile the key again after `duration`.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Delay before the key should be reconciled again, if any.
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Something that can reconcile a key; the worker pool drives it.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync {
    /// Bring the object behind `key` to its desired state.
    async fn reconcile(&self, key: &ReconcileKey) -> Result<Action, ControllerError>;
}

/// Environment variable requested by the injection annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInjection {
    /// Variable name
    pub name: String,
    /// Literal value, possibly empty
    pub value: String,
}

/// Parse `NAME__value`. Exactly two tokens are required and the name must
/// be non-empty; an empty value injects an empty string.
pub fn parse_injection(raw: &str) -> Result<EnvInjection, ControllerError> {
    match raw.split(INJECT_SEPARATOR).collect::<Vec<_>>().as_slice() {
        [name, value] if !name.is_empty() => Ok(EnvInjection {
            name: (*name).to_string(),
            value: (*value).to_string(),
        }),
        tokens => Err(ControllerError::MalformedInput(format!(
            "{} must be NAME{}value, got {:?} ({} tokens)",
            INJECT_ANNOTATION,
            INJECT_SEPARATOR,
            raw,
            tokens.len()
        ))),
    }
}

/// Bring `deployment` in line with `injection`. Returns whether anything changed.
///
/// Per container: the last entry with the same name (the one the kubelet
/// honours) is set to the desired literal value if it differs, otherwise the
/// entry is appended. Entries that already match are left alone, so repeated
/// calls are no-ops.
pub fn apply_injection(deployment: &mut Deployment, injection: &EnvInjection) -> bool {
    let mut changed = false;

    let containers = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .map(|pod| pod.containers.as_mut_slice())
        .unwrap_or_default();

    for container in containers {
        let env = container.env.get_or_insert_with(Vec::new);
        match env.iter_mut().rev().find(|var| var.name == injection.name) {
            Some(var) if var.value.as_deref() == Some(injection.value.as_str()) && var.value_from.is_none() => {}
            Some(var) => {
                var.value = Some(injection.value.clone());
                var.value_from = None;
                changed = true;
            }
            None => {
                env.push(EnvVar {
                    name: injection.name.clone(),
                    value: Some(injection.value.clone()),
                    ..Default::default()
                });
                changed = true;
            }
        }
    }

    if changed {
        deployment
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .entry(MANAGED_ANNOTATION.to_string())
            .or_insert_with(|| MANAGED_VALUE.to_string());
    }
    changed
}

/// Reconciles Deployments against the object store.
pub struct Reconciler {
    store: Arc<dyn StoreClientTrait>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(store: Arc<dyn StoreClientTrait>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Reconcile for Reconciler {
    /// Reconciles one Deployment.
    ///
    /// This method:
    /// 1. Fetches the Deployment (gone means nothing to do)
    /// 2. Parses the injection annotation (malformed input is logged and dropped)
    /// 3. Applies the injection to every container, idempotently
    /// 4. Writes back with the resourceVersion from step 1, if anything changed
    ///
    /// A stale resourceVersion surfaces as a retryable `Conflict`; the retry
    /// starts over from a fresh read.
    async fn reconcile(&self, key: &ReconcileKey) -> Result<Action, ControllerError> {
        let mut deployment = match self.store.get_deployment(&key.namespace, &key.name).await {
            Ok(deployment) => deployment,
            Err(StoreError::NotFound(_)) => {
                info!(namespace = %key.namespace, name = %key.name, "Deployment not found, skipping");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(raw) = deployment
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(INJECT_ANNOTATION))
            .cloned()
        else {
            debug!(namespace = %key.namespace, name = %key.name, "No {} annotation", INJECT_ANNOTATION);
            return Ok(Action::await_change());
        };

        let injection = match parse_injection(&raw) {
            Ok(injection) => injection,
            Err(e) => {
                // Retrying cannot fix a static string
                warn!(namespace = %key.namespace, name = %key.name, error = %e, "Ignoring malformed annotation");
                return Ok(Action::await_change());
            }
        };

        if !apply_injection(&mut deployment, &injection) {
            debug!(namespace = %key.namespace, name = %key.name, env = %injection.name, "Deployment already up to date");
            return Ok(Action::await_change());
        }

        match self.store.update_deployment(&deployment).await {
            Ok(_) => {
                info!(namespace = %key.namespace, name = %key.name, env = %injection.name, "Injected env into Deployment");
                Ok(Action::await_change())
            }
            Err(e @ StoreError::Conflict(_)) => {
                debug!(namespace = %key.namespace, name = %key.name, "Deployment changed since read, will retry");
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}
