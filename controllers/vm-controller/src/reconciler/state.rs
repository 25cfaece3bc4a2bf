//! Per-resource state held by the reconciler

use crate::bridge::BridgeBinding;
use chrono::{DateTime, Utc};
use kubevirt_client::{ClusterPhase, NetworkIdentity, ObservedState, ResourceId, ResourceSpec};
use serde::Serialize;
use std::fmt;

/// Lifecycle of a managed VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceStatus {
    /// Accepted by the controller, apply in flight
    Requested,
    /// Accepted by the cluster, not yet ready or not yet bridged
    Pending,
    /// Ready and bound to the bridge
    Running,
    /// Delete in progress
    Terminating,
    Deleted,
    Failed,
}

impl ResourceStatus {
    /// Whether a create for the same id must be treated as a duplicate
    pub fn is_live(self) -> bool {
        !matches!(self, ResourceStatus::Deleted | ResourceStatus::Failed)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Requested => "Requested",
            ResourceStatus::Pending => "Pending",
            ResourceStatus::Running => "Running",
            ResourceStatus::Terminating => "Terminating",
            ResourceStatus::Deleted => "Deleted",
            ResourceStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Everything the controller knows about one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedResource {
    pub id: ResourceId,
    /// Subject that created it
    pub owner: String,
    pub desired: ResourceSpec,
    pub status: ResourceStatus,
    pub observed: Option<ObservedState>,
    /// Cluster uid of the object this record tracks
    pub uid: Option<String>,
    pub assigned_interface: Option<BridgeBinding>,
    pub network: Option<NetworkIdentity>,
    /// Consecutive drift repairs without a matching observation
    pub drift_attempts: u32,
    /// Drift repair gave up; a `Failed` record with this set stays failed
    pub repair_exhausted: bool,
    /// Resource version of our own last write; older observations are stale
    pub last_write_version: Option<u64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_reconciled: DateTime<Utc>,
}

impl ManagedResource {
    pub fn new(desired: ResourceSpec, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: desired.id(),
            owner: owner.into(),
            desired,
            status: ResourceStatus::Requested,
            observed: None,
            uid: None,
            assigned_interface: None,
            network: None,
            drift_attempts: 0,
            repair_exhausted: false,
            last_write_version: None,
            last_error: None,
            created_at: now,
            last_reconciled: now,
        }
    }

    pub fn observed_phase(&self) -> Option<ClusterPhase> {
        self.observed.as_ref().map(|o| o.phase)
    }

    /// Move to `status`, stamping `last_reconciled`
    pub(crate) fn transition(&mut self, status: ResourceStatus) {
        self.status = status;
        self.last_reconciled = Utc::now();
    }

    /// Record the version of a write we just made
    pub(crate) fn note_write(&mut self, resource_version: Option<&str>) {
        if let Some(version) = resource_version.and_then(parse_version) {
            self.last_write_version = Some(
                self.last_write_version
                    .map_or(version, |previous| previous.max(version)),
            );
        }
    }

    /// Whether an observation predates (or is) our own last write
    pub(crate) fn is_stale(&self, observed: &ObservedState) -> bool {
        match (
            self.last_write_version,
            observed.resource_version.as_deref().and_then(parse_version),
        ) {
            (Some(written), Some(seen)) => seen <= written,
            _ => false,
        }
    }
}

/// Resource versions are opaque strings; ordering is only meaningful when they are numeric
pub(crate) fn parse_version(version: &str) -> Option<u64> {
    version.parse().ok()
}
