//! Caller-initiated lifecycle operations

use super::state::{ManagedResource, ResourceStatus};
use super::Reconciler;
use crate::error::ControllerError;
use kubevirt_client::{ClusterError, ResourceId, ResourceSpec};
use tracing::{debug, error, info, warn};

impl Reconciler {
    /// Create a VM
    ///
    /// A live id held by another owner is a `Conflict`. An identical spec
    /// for a live id returns the existing record; a different spec is a
    /// `Conflict`. `Deleted` and `Failed` ids may be created again, by anyone.
    pub(crate) async fn create_inner(&self, spec: &ResourceSpec, owner: &str) -> Result<ManagedResource, ControllerError> {
        spec.validate().map_err(ControllerError::InvalidSpec)?;
        let id = spec.id();
        let _guard = self.lock(&id).await;

        let previous = self.status(&id);
        if let Some(existing) = previous.as_ref().filter(|r| r.status.is_live()) {
            if existing.owner != owner {
                debug!(resource = %id, owner, holder = %existing.owner, "Create for a VM owned by someone else");
                return Err(ControllerError::Conflict(format!("{id} is already taken")));
            }
            if existing.status == ResourceStatus::Terminating {
                return Err(ControllerError::Conflict(format!("{id} is being deleted")));
            }
            if existing.desired.fingerprint() == spec.fingerprint() {
                debug!(resource = %id, status = %existing.status, "Create matches existing resource");
                return Ok(existing.clone());
            }
            return Err(ControllerError::Conflict(format!(
                "{id} already exists with a different spec"
            )));
        }

        let mut resource = ManagedResource::new(spec.clone(), owner);
        self.commit(&resource);
        info!(resource = %id, owner, "VM requested");

        match self.cluster.apply(spec, owner).await {
            Ok(handle) => {
                resource.uid = handle.uid;
                resource.note_write(handle.resource_version.as_deref());
                resource.transition(ResourceStatus::Pending);
                self.commit(&resource);
                info!(resource = %id, created = handle.created, "VM accepted by cluster");
                Ok(resource)
            }
            Err(ClusterError::Conflict(msg)) => {
                match &previous {
                    Some(previous) => self.commit(previous),
                    None => self.forget(&id),
                }
                warn!(resource = %id, reason = %msg, "Cluster already has a different VM under this name");
                Err(ControllerError::Conflict(msg))
            }
            Err(e) => {
                resource.last_error = Some(e.to_string());
                resource.transition(ResourceStatus::Failed);
                self.commit(&resource);
                error!(resource = %id, error = %e, "Failed to apply VM");
                Err(e.into())
            }
        }
    }

    /// Resize a `Pending` or `Running` VM
    ///
    /// Only CPU and memory may change. Credentials left empty keep the
    /// current ones. The VM is restarted so the guest sees the new size.
    pub(crate) async fn update_inner(&self, mut spec: ResourceSpec) -> Result<ManagedResource, ControllerError> {
        spec.validate().map_err(ControllerError::InvalidSpec)?;
        let id = spec.id();
        let _guard = self.lock(&id).await;

        let mut resource = self
            .status(&id)
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))?;
        if !matches!(resource.status, ResourceStatus::Pending | ResourceStatus::Running) {
            return Err(ControllerError::Conflict(format!(
                "{id} is {}; only Pending or Running VMs can be updated",
                resource.status
            )));
        }
        if spec.image != resource.desired.image || spec.disk_gib != resource.desired.disk_gib {
            return Err(ControllerError::InvalidSpec(
                "only cpu_cores and memory_gib can be changed".to_string(),
            ));
        }
        if spec.credentials.is_none() {
            spec.credentials.clone_from(&resource.desired.credentials);
        }
        if spec.fingerprint() == resource.desired.fingerprint() {
            debug!(resource = %id, "Update matches desired spec");
            return Ok(resource);
        }

        let previous = std::mem::replace(&mut resource.desired, spec);
        resource.drift_attempts = 0;
        self.commit(&resource);

        match self.cluster.replace(&resource.desired, &resource.owner).await {
            Ok(handle) => {
                resource.note_write(handle.resource_version.as_deref());
                resource.last_error = None;
                if let Err(e) = self.cluster.restart(&id).await {
                    warn!(resource = %id, error = %e, "Restart after resize failed, new size applies on next boot");
                    resource.last_error = Some(e.to_string());
                }
                resource.last_reconciled = chrono::Utc::now();
                self.commit(&resource);
                info!(
                    resource = %id,
                    cpu_cores = resource.desired.cpu_cores,
                    memory_gib = resource.desired.memory_gib,
                    "VM resized"
                );
                Ok(resource)
            }
            Err(ClusterError::NotFound(msg)) => {
                resource.desired = previous;
                if matches!(self.cluster.get(&id).await, Ok(None)) {
                    self.bridge.unbind(&id).await;
                    resource.assigned_interface = None;
                    resource.last_error = Some(format!("VM disappeared from the cluster: {msg}"));
                    resource.transition(ResourceStatus::Failed);
                    warn!(resource = %id, "VM vanished during resize, marking Failed");
                }
                self.commit(&resource);
                Err(ControllerError::NotFound(msg))
            }
            Err(e) => {
                resource.desired = previous;
                resource.last_error = Some(e.to_string());
                self.commit(&resource);
                warn!(resource = %id, error = %e, "Resize failed");
                Err(e.into())
            }
        }
    }

    /// Delete a VM
    ///
    /// The record stays `Terminating` until a `Deleted` watch event arrives,
    /// or the cluster confirms the object is already gone.
    pub(crate) async fn delete_inner(&self, id: &ResourceId) -> Result<ManagedResource, ControllerError> {
        let _guard = self.lock(id).await;

        let mut resource = self
            .status(id)
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))?;
        if resource.status == ResourceStatus::Deleted {
            debug!(resource = %id, "Already deleted");
            return Ok(resource);
        }

        resource.transition(ResourceStatus::Terminating);
        self.commit(&resource);
        info!(resource = %id, "Deleting VM");

        let outcome = self.bridge.unbind(id).await;
        debug!(resource = %id, ?outcome, "Bridge binding released");
        resource.assigned_interface = None;
        self.commit(&resource);

        match self.cluster.delete(id).await {
            Ok(()) => {
                info!(resource = %id, "Delete submitted, waiting for cluster confirmation");
                Ok(resource)
            }
            Err(ClusterError::NotFound(_)) => match self.cluster.get(id).await {
                Ok(None) => {
                    resource.network = None;
                    resource.transition(ResourceStatus::Deleted);
                    self.commit(&resource);
                    info!(resource = %id, "VM already absent from cluster, deleted");
                    Ok(resource)
                }
                Ok(Some(_)) => {
                    resource.last_error = Some("delete reported not found but the VM still exists".to_string());
                    self.commit(&resource);
                    warn!(resource = %id, "Delete reported not found but the VM still exists");
                    Ok(resource)
                }
                Err(e) => {
                    resource.last_error = Some(e.to_string());
                    self.commit(&resource);
                    Err(e.into())
                }
            },
            Err(e) => {
                resource.last_error = Some(e.to_string());
                self.commit(&resource);
                error!(resource = %id, error = %e, "Failed to delete VM");
                Err(e.into())
            }
        }
    }
}
