//! Resource reconciliation
//!
//! The reconciler owns the table of managed VMs and drives each one through
//! `Requested → Pending → Running → Terminating → Deleted`, with `Failed`
//! reachable from the non-terminal states.
//!
//! - `lifecycle`: caller-initiated create / update / delete
//! - `events`: watch events, resync, adoption, drift repair and network promotion
//!
//! Every mutation of a record happens under that record's id lock. Reads
//! (`status`, `list`) only take the table read lock and see the last
//! committed record. Caller-initiated mutations run on their own task so a
//! caller that gives up does not abort a half-submitted cluster operation.

mod events;
mod lifecycle;
pub mod state;

#[cfg(test)]
mod events_test;

use crate::bridge::BridgeCoordinator;
use crate::error::ControllerError;
use kubevirt_client::{ClusterClientTrait, ResourceId, ResourceSpec};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

pub use state::{ManagedResource, ResourceStatus};

/// Reconciles managed VMs against the cluster and the host bridge.
pub struct Reconciler {
    pub(crate) cluster: Arc<dyn ClusterClientTrait>,
    pub(crate) bridge: Arc<BridgeCoordinator>,
    resources: RwLock<HashMap<ResourceId, ManagedResource>>,
    locks: Mutex<HashMap<ResourceId, Arc<AsyncMutex<()>>>>,
    max_reconcile_attempts: u32,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("bridge", &self.bridge)
            .field("max_reconcile_attempts", &self.max_reconcile_attempts)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterClientTrait>,
        bridge: Arc<BridgeCoordinator>,
        max_reconcile_attempts: u32,
    ) -> Self {
        Self {
            cluster,
            bridge,
            resources: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            max_reconcile_attempts,
        }
    }

    /// Last committed record for `id`
    pub fn status(&self, id: &ResourceId) -> Option<ManagedResource> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Last committed records, optionally limited to one namespace, ordered by id
    pub fn list(&self, namespace: Option<&str>) -> Vec<ManagedResource> {
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        let mut items: Vec<ManagedResource> = resources
            .values()
            .filter(|r| namespace.is_none_or(|ns| r.id.namespace == ns))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    /// Submit a create; see [`Self::create_inner`]
    pub async fn create(self: &Arc<Self>, spec: ResourceSpec, owner: String) -> Result<ManagedResource, ControllerError> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.create_inner(&spec, &owner).await }).await?
    }

    /// Submit a resize; see [`Self::update_inner`]
    pub async fn update(self: &Arc<Self>, spec: ResourceSpec) -> Result<ManagedResource, ControllerError> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.update_inner(spec).await }).await?
    }

    /// Submit a delete; see [`Self::delete_inner`]
    pub async fn delete(self: &Arc<Self>, id: ResourceId) -> Result<ManagedResource, ControllerError> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.delete_inner(&id).await }).await?
    }

    pub(crate) fn commit(&self, resource: &ManagedResource) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.id.clone(), resource.clone());
    }

    pub(crate) fn forget(&self, id: &ResourceId) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Drop `Deleted` records last touched more than `retention` ago
    ///
    /// Lock entries no longer backing a record and not held by anyone are
    /// released at the same time. Returns how many records were dropped.
    pub fn evict_tombstones(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        let before = resources.len();
        resources.retain(|_, r| {
            let expired = (now - r.last_reconciled)
                .to_std()
                .is_ok_and(|age| age >= retention);
            !(r.status == ResourceStatus::Deleted && expired)
        });
        let evicted = before - resources.len();

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|id, lock| Arc::strong_count(lock) > 1 || resources.contains_key(id));
        if evicted > 0 {
            debug!(evicted, remaining = resources.len(), "Evicted deleted VM records");
        }
        evicted
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Exclusive access to one resource id
    pub(crate) async fn lock(&self, id: &ResourceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
