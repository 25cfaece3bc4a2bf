//! Network bridge coordinator
//!
//! Owns the mapping from managed VMs to host links enslaved to the bridge.
//! At most one binding exists per resource. Bindings are serialized behind a
//! single lock so the capacity check and the attach happen atomically.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use hostnet_client::{HostNetworkError, HostNetworkTrait};
use kubevirt_client::{NetworkIdentity, ResourceId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A VM interface attached to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeBinding {
    pub resource_id: ResourceId,
    pub bridge: String,
    pub interface_name: String,
    pub link_index: u32,
    pub bound_at: DateTime<Utc>,
}

/// What `unbind` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindOutcome {
    /// Nothing was bound
    NotBound,
    /// Link detached (or already gone)
    Released,
    /// Detach failed; queued for `retry_deferred`
    Deferred,
}

#[derive(Debug, Clone)]
struct DeferredDetach {
    resource_id: ResourceId,
    interface_name: String,
}

pub struct BridgeCoordinator {
    host: Arc<dyn HostNetworkTrait>,
    bridge: String,
    uplink: String,
    capacity: usize,
    bindings: Mutex<HashMap<ResourceId, BridgeBinding>>,
    deferred: Mutex<Vec<DeferredDetach>>,
}

impl std::fmt::Debug for BridgeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeCoordinator")
            .field("bridge", &self.bridge)
            .field("uplink", &self.uplink)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl BridgeCoordinator {
    pub fn new(
        host: Arc<dyn HostNetworkTrait>,
        bridge: impl Into<String>,
        uplink: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            host,
            bridge: bridge.into(),
            uplink: uplink.into(),
            capacity,
            bindings: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Enslave the configured uplink to the bridge
    pub async fn ensure_uplink(&self) -> Result<(), ControllerError> {
        let bridge = self.bridge_index().await?;
        let uplink = self.host.link_index(&self.uplink).await?.ok_or_else(|| {
            ControllerError::InterfaceUnavailable(format!("uplink '{}' not found", self.uplink))
        })?;
        self.host.attach(uplink, bridge).await?;
        self.host.set_up(uplink).await?;
        self.host.set_up(bridge).await?;
        info!(bridge = %self.bridge, uplink = %self.uplink, "Uplink attached to bridge");
        Ok(())
    }

    /// Attach the VM interface described by `identity` to the bridge
    ///
    /// `identity.interface_name` names a link in the host namespace. The
    /// uplink and the bridge itself are never accepted, whatever name
    /// resolves to them. Binding the interface already bound to `id` returns
    /// the existing binding. Binding a different interface replaces the old one.
    pub async fn bind(&self, id: &ResourceId, identity: &NetworkIdentity) -> Result<BridgeBinding, ControllerError> {
        let mut bindings = self.bindings.lock().await;

        let current = bindings
            .get(id)
            .filter(|existing| existing.interface_name == identity.interface_name);
        if let Some(existing) = current {
            debug!(resource = %id, interface = %existing.interface_name, "Already bound");
            return Ok(existing.clone());
        }

        let others = bindings.keys().filter(|bound| *bound != id).count();
        if others >= self.capacity {
            return Err(ControllerError::InterfaceUnavailable(format!(
                "bridge '{}' is at capacity ({})",
                self.bridge, self.capacity
            )));
        }

        if identity.interface_name == self.uplink || identity.interface_name == self.bridge {
            return Err(self.reserved(id, &identity.interface_name));
        }

        let bridge = self.bridge_index().await?;
        let link = self
            .host
            .link_index(&identity.interface_name)
            .await?
            .ok_or_else(|| {
                ControllerError::InterfaceUnavailable(format!(
                    "host link '{}' for {id} not found",
                    identity.interface_name
                ))
            })?;
        let uplink = self.host.link_index(&self.uplink).await?;
        if link == bridge || Some(link) == uplink {
            return Err(self.reserved(id, &identity.interface_name));
        }

        self.host.attach(link, bridge).await.map_err(|e| match e {
            HostNetworkError::LinkNotFound(what) => ControllerError::InterfaceUnavailable(what),
            other => ControllerError::HostNetwork(other),
        })?;
        self.host.set_up(link).await?;

        // A detach queued for this interface by an earlier owner must not
        // undo the attach above.
        self.deferred
            .lock()
            .await
            .retain(|detach| detach.interface_name != identity.interface_name);

        let binding = BridgeBinding {
            resource_id: id.clone(),
            bridge: self.bridge.clone(),
            interface_name: identity.interface_name.clone(),
            link_index: link,
            bound_at: Utc::now(),
        };

        if let Some(previous) = bindings.insert(id.clone(), binding.clone()) {
            info!(
                resource = %id,
                old_interface = %previous.interface_name,
                new_interface = %binding.interface_name,
                "Replacing bridge binding"
            );
            self.release(previous).await;
        }

        info!(
            resource = %id,
            interface = %binding.interface_name,
            bridge = %self.bridge,
            "Interface bound to bridge"
        );
        Ok(binding)
    }

    /// Release the binding for `id`; never fails
    pub async fn unbind(&self, id: &ResourceId) -> UnbindOutcome {
        let removed = self.bindings.lock().await.remove(id);
        match removed {
            Some(binding) => self.release(binding).await,
            None => UnbindOutcome::NotBound,
        }
    }

    async fn release(&self, binding: BridgeBinding) -> UnbindOutcome {
        match self.detach_by_name(&binding.interface_name).await {
            Ok(()) => {
                info!(
                    resource = %binding.resource_id,
                    interface = %binding.interface_name,
                    "Interface released from bridge"
                );
                UnbindOutcome::Released
            }
            Err(e) => {
                warn!(
                    resource = %binding.resource_id,
                    interface = %binding.interface_name,
                    error = %e,
                    "Detach failed, deferring"
                );
                self.deferred.lock().await.push(DeferredDetach {
                    resource_id: binding.resource_id,
                    interface_name: binding.interface_name,
                });
                UnbindOutcome::Deferred
            }
        }
    }

    /// A link that no longer exists counts as detached
    async fn detach_by_name(&self, interface_name: &str) -> Result<(), HostNetworkError> {
        let Some(link) = self.host.link_index(interface_name).await? else {
            return Ok(());
        };
        match self.host.detach(link).await {
            Ok(()) | Err(HostNetworkError::LinkNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Retry deferred detaches; returns how many completed
    pub async fn retry_deferred(&self) -> usize {
        let pending = std::mem::take(&mut *self.deferred.lock().await);
        if pending.is_empty() {
            return 0;
        }

        let mut completed = 0;
        let mut still_pending = Vec::new();
        for detach in pending {
            match self.detach_by_name(&detach.interface_name).await {
                Ok(()) => {
                    debug!(
                        resource = %detach.resource_id,
                        interface = %detach.interface_name,
                        "Deferred detach completed"
                    );
                    completed += 1;
                }
                Err(e) => {
                    debug!(
                        resource = %detach.resource_id,
                        interface = %detach.interface_name,
                        error = %e,
                        "Deferred detach still failing"
                    );
                    still_pending.push(detach);
                }
            }
        }
        self.deferred.lock().await.extend(still_pending);
        completed
    }

    pub async fn binding(&self, id: &ResourceId) -> Option<BridgeBinding> {
        self.bindings.lock().await.get(id).cloned()
    }

    pub async fn binding_count(&self) -> usize {
        self.bindings.lock().await.len()
    }

    pub async fn deferred_detaches(&self) -> usize {
        self.deferred.lock().await.len()
    }

    fn reserved(&self, id: &ResourceId, interface_name: &str) -> ControllerError {
        warn!(resource = %id, interface = %interface_name, "Refusing to bind a reserved host link");
        ControllerError::InterfaceUnavailable(format!(
            "host link '{interface_name}' is reserved for bridge '{}' (uplink '{}')",
            self.bridge, self.uplink
        ))
    }

    async fn bridge_index(&self) -> Result<u32, ControllerError> {
        self.host.link_index(&self.bridge).await?.ok_or_else(|| {
            ControllerError::InterfaceUnavailable(format!("bridge '{}' not found", self.bridge))
        })
    }
}
