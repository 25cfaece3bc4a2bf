//! Watch event handling
//!
//! Events for ids the controller has no record of are ignored, with one
//! exception: an object carrying this controller's managed-by label and an
//! owner annotation that shows up in a resync list is adopted. That is how a
//! restarted controller picks its VMs back up. Events carrying a different
//! uid than the record belong to an older or newer object under the same name
//! and are ignored too.
//!
//! A resync also reports which objects were listed. Records the cluster no
//! longer lists (and no longer returns on a direct read) are tombstoned,
//! since their `Deleted` event was lost with the watch history.

use super::state::{ManagedResource, ResourceStatus};
use super::Reconciler;
use crate::error::ControllerError;
use kubevirt_client::{ClusterPhase, ResourceId, ResourceSpec, WatchEvent, WatchEventKind};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

impl Reconciler {
    /// Apply one watch event to the record it refers to
    pub async fn handle_event(&self, event: WatchEvent) {
        let id = event.id.clone();
        let _guard = self.lock(&id).await;

        let Some(mut resource) = self.status(&id) else {
            self.adopt(event).await;
            return;
        };

        let foreign = matches!(
            (&resource.uid, &event.observed.uid),
            (Some(ours), Some(theirs)) if ours != theirs
        );
        if foreign {
            debug!(resource = %id, kind = %event.kind, uid = ?event.observed.uid, "Ignoring event for another object");
            return;
        }

        match event.kind {
            WatchEventKind::Deleted => {
                if resource.status == ResourceStatus::Deleted {
                    return;
                }
                let outcome = self.bridge.unbind(&id).await;
                resource.assigned_interface = None;
                resource.network = None;
                resource.observed = Some(event.observed);
                resource.transition(ResourceStatus::Deleted);
                self.commit(&resource);
                info!(resource = %id, event = %event.event_id, ?outcome, "VM deleted");
            }
            WatchEventKind::Added | WatchEventKind::Modified => {
                match resource.status {
                    ResourceStatus::Deleted => {
                        debug!(resource = %id, kind = %event.kind, "Ignoring event for deleted VM");
                        return;
                    }
                    ResourceStatus::Failed
                        if !resource.repair_exhausted && event.observed.phase != ClusterPhase::Failed =>
                    {
                        info!(
                            resource = %id,
                            event = %event.event_id,
                            phase = %event.observed.phase,
                            "VM recovered"
                        );
                        resource.last_error = None;
                        resource.transition(ResourceStatus::Pending);
                    }
                    ResourceStatus::Terminating | ResourceStatus::Failed => {
                        resource.observed = Some(event.observed);
                        self.commit(&resource);
                        return;
                    }
                    ResourceStatus::Requested | ResourceStatus::Pending | ResourceStatus::Running => {}
                }

                if resource.uid.is_none() {
                    resource.uid.clone_from(&event.observed.uid);
                }
                let stale = resource.is_stale(&event.observed);
                resource.observed = Some(event.observed);

                if !stale && !self.repair_drift(&mut resource, event.event_id).await {
                    self.commit(&resource);
                    return;
                }
                self.apply_phase(&mut resource, event.event_id).await;
                self.commit(&resource);
            }
        }
    }

    /// Take over a labelled VM seen in a resync list
    ///
    /// The caller holds the id lock and has checked there is no record.
    async fn adopt(&self, event: WatchEvent) {
        let id = event.id;
        let observed = event.observed;
        let adoptable = event.synthetic && event.kind != WatchEventKind::Deleted && observed.managed;
        let (true, Some(owner), Some(fingerprint)) =
            (adoptable, observed.owner.clone(), observed.fingerprint.clone())
        else {
            debug!(resource = %id, kind = %event.kind, "Ignoring event for unmanaged VM");
            return;
        };

        let spec = ResourceSpec {
            name: id.name.clone(),
            namespace: id.namespace.clone(),
            image: fingerprint.image,
            cpu_cores: fingerprint.cpu_cores,
            memory_gib: fingerprint.memory_gib,
            disk_gib: fingerprint.disk_gib,
            credentials: None,
        };
        let mut resource = ManagedResource::new(spec, owner);
        resource.uid.clone_from(&observed.uid);
        // The object already matches what we adopted it as
        resource.note_write(observed.resource_version.as_deref());
        resource.observed = Some(observed);
        resource.transition(ResourceStatus::Pending);
        self.apply_phase(&mut resource, event.event_id).await;
        self.commit(&resource);
        info!(
            resource = %id,
            owner = %resource.owner,
            status = %resource.status,
            event = %event.event_id,
            "Adopted VM"
        );
    }

    /// Tombstone records in `namespace` that a completed resync did not list
    ///
    /// Each candidate is confirmed absent with a direct read before its
    /// binding is released; a failed read keeps the record as it is.
    /// Returns how many records moved to `Deleted`.
    pub async fn handle_resync(&self, namespace: &str, listed: &BTreeSet<ResourceId>) -> usize {
        let missing: Vec<ResourceId> = self
            .list(Some(namespace))
            .into_iter()
            .filter(|r| r.status != ResourceStatus::Deleted && r.uid.is_some() && !listed.contains(&r.id))
            .map(|r| r.id)
            .collect();

        let mut deleted = 0;
        for id in missing {
            let _guard = self.lock(&id).await;
            let Some(mut resource) = self.status(&id) else {
                continue;
            };
            if resource.status == ResourceStatus::Deleted || resource.uid.is_none() {
                continue;
            }
            match self.cluster.get(&id).await {
                Ok(None) => {
                    let outcome = self.bridge.unbind(&id).await;
                    resource.assigned_interface = None;
                    resource.network = None;
                    resource.transition(ResourceStatus::Deleted);
                    self.commit(&resource);
                    deleted += 1;
                    info!(resource = %id, ?outcome, "VM missing after resync, deleted");
                }
                Ok(Some(_)) => {
                    debug!(resource = %id, "VM created after the resync list, keeping");
                }
                Err(e) => {
                    warn!(resource = %id, error = %e, "Could not confirm VM is gone, keeping");
                }
            }
        }
        deleted
    }

    /// Replace the object when its observed spec differs from the desired one
    ///
    /// Returns `false` once the attempt budget is spent and the record has
    /// been moved to `Failed`.
    async fn repair_drift(&self, resource: &mut ManagedResource, event_id: Uuid) -> bool {
        let Some(observed) = resource.observed.as_ref().and_then(|o| o.fingerprint.clone()) else {
            return true;
        };
        let desired = resource.desired.fingerprint();
        if observed == desired {
            if resource.drift_attempts > 0 {
                info!(resource = %resource.id, attempts = resource.drift_attempts, "Drift repaired");
            }
            resource.drift_attempts = 0;
            return true;
        }

        if resource.drift_attempts >= self.max_reconcile_attempts {
            let err = ControllerError::ReconciliationExhausted(format!(
                "{} still differs from desired spec after {} replacements",
                resource.id, resource.drift_attempts
            ));
            error!(
                resource = %resource.id,
                event = %event_id,
                attempts = resource.drift_attempts,
                error = %err,
                "ALERT: drift repair exhausted, marking VM Failed"
            );
            self.bridge.unbind(&resource.id).await;
            resource.assigned_interface = None;
            resource.last_error = Some(err.to_string());
            resource.repair_exhausted = true;
            resource.transition(ResourceStatus::Failed);
            return false;
        }

        resource.drift_attempts += 1;
        warn!(
            resource = %resource.id,
            event = %event_id,
            attempt = resource.drift_attempts,
            ?observed,
            ?desired,
            "Drift detected, replacing VM spec"
        );
        match self.cluster.replace(&resource.desired, &resource.owner).await {
            Ok(handle) => resource.note_write(handle.resource_version.as_deref()),
            Err(e) => {
                warn!(resource = %resource.id, event = %event_id, error = %e, "Drift repair failed");
                resource.last_error = Some(e.to_string());
            }
        }
        true
    }

    async fn apply_phase(&self, resource: &mut ManagedResource, event_id: Uuid) {
        let Some(phase) = resource.observed_phase() else {
            return;
        };
        match (resource.status, phase) {
            (_, ClusterPhase::Failed) => {
                let printable = resource
                    .observed
                    .as_ref()
                    .map(|o| o.printable_status.clone())
                    .unwrap_or_default();
                self.bridge.unbind(&resource.id).await;
                resource.assigned_interface = None;
                resource.last_error = Some(format!("cluster reports {printable}"));
                resource.transition(ResourceStatus::Failed);
                warn!(resource = %resource.id, event = %event_id, status = %printable, "VM failed");
            }
            (ResourceStatus::Pending, ClusterPhase::Ready) => self.promote(resource).await,
            (ResourceStatus::Running, ClusterPhase::Ready) => {}
            (ResourceStatus::Running, _) => {
                resource.transition(ResourceStatus::Pending);
                info!(resource = %resource.id, event = %event_id, %phase, "VM no longer ready, keeping binding");
            }
            _ => {}
        }
    }

    /// `Pending` + ready → bind the cluster-assigned interface → `Running`
    async fn promote(&self, resource: &mut ManagedResource) {
        let identity = match self.cluster.network_identity(&resource.id).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                debug!(resource = %resource.id, "No network identity yet, staying Pending");
                return;
            }
            Err(e) => {
                warn!(resource = %resource.id, error = %e, "Failed to read network identity");
                resource.last_error = Some(e.to_string());
                return;
            }
        };

        match self.bridge.bind(&resource.id, &identity).await {
            Ok(binding) => {
                info!(
                    resource = %resource.id,
                    interface = %binding.interface_name,
                    ip = ?identity.ip_address,
                    "VM running"
                );
                resource.assigned_interface = Some(binding);
                resource.network = Some(identity);
                resource.last_error = None;
                resource.transition(ResourceStatus::Running);
            }
            Err(e) => {
                warn!(resource = %resource.id, error = %e, "Bridge bind failed, staying Pending");
                resource.last_error = Some(e.to_string());
            }
        }
    }

    /// Retry promotion of ready VMs still waiting on their network
    pub async fn retry_pending_network(&self) -> usize {
        let waiting: Vec<_> = self
            .list(None)
            .into_iter()
            .filter(|r| r.status == ResourceStatus::Pending && r.observed_phase() == Some(ClusterPhase::Ready))
            .map(|r| r.id)
            .collect();

        let mut promoted = 0;
        for id in waiting {
            let _guard = self.lock(&id).await;
            let Some(mut resource) = self.status(&id) else {
                continue;
            };
            if resource.status != ResourceStatus::Pending || resource.observed_phase() != Some(ClusterPhase::Ready) {
                continue;
            }
            self.promote(&mut resource).await;
            if resource.status == ResourceStatus::Running {
                promoted += 1;
            }
            self.commit(&resource);
        }
        promoted
    }
}
