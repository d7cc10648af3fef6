//! Store-level data models
//!
//! Deployments are passed around as `k8s_openapi` types; leases are reduced
//! to the fields leader election needs so that callers never touch the
//! Kubernetes time wrappers.

use chrono::{DateTime, Utc};

/// Holder record of a coordination lease.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaseRecord {
    /// Identity of the current holder; empty when released
    pub holder_identity: String,
    /// How long the holder may go without renewing before the lease is up for grabs
    pub lease_duration_seconds: i32,
    /// When the current holder acquired the lease
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the current holder last renewed the lease
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes over the lifetime of the lease
    pub lease_transitions: i32,
}

/// A lease record together with the resourceVersion it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLease {
    /// The holder record
    pub record: LeaseRecord,
    /// Version the record was read at; updates must carry it
    pub resource_version: String,
}
