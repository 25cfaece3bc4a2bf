//! Inbound command facade
//!
//! The typed contract an HTTP layer calls. Every command takes the caller's
//! raw bearer token and runs authentication, authorization and ownership
//! checks before reaching the reconciler.
//!
//! Alongside the reconciler's records the control plane keeps a small ledger
//! per VM: the template it was created from (resizes are clamped to it) and
//! the cost rate in force after each create or resize.

use crate::auth::{Action, AuthGuard, Identity};
use crate::error::ControllerError;
use crate::reconciler::{ManagedResource, Reconciler, ResourceStatus};
use crate::templates::{hourly_cost_cents, ResourceRequest, TemplateCatalog};
use chrono::{DateTime, Utc};
use kubevirt_client::{ClusterPhase, ResourceId, SnapshotInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    /// Defaults to the configured namespace
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub template_id: Option<u32>,
    /// Required when no template is given
    #[serde(default)]
    pub image: Option<String>,
    pub cpu_cores: u32,
    pub memory_gib: u32,
    pub disk_gib: u32,
    /// Guest password delivered through cloud-init
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResizeVmRequest {
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub memory_gib: Option<u32>,
}

/// What callers see of a managed VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmView {
    pub id: String,
    pub namespace: String,
    pub name: String,
    pub owner: String,
    pub status: ResourceStatus,
    pub phase: Option<ClusterPhase>,
    pub printable_status: Option<String>,
    pub interface: Option<String>,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub cpu_cores: u32,
    pub memory_gib: u32,
    pub disk_gib: u32,
    pub cost_per_hour_cents: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_reconciled: DateTime<Utc>,
}

impl From<&ManagedResource> for VmView {
    fn from(resource: &ManagedResource) -> Self {
        let desired = &resource.desired;
        Self {
            id: resource.id.to_string(),
            namespace: resource.id.namespace.clone(),
            name: resource.id.name.clone(),
            owner: resource.owner.clone(),
            status: resource.status,
            phase: resource.observed_phase(),
            printable_status: resource.observed.as_ref().map(|o| o.printable_status.clone()),
            interface: resource
                .assigned_interface
                .as_ref()
                .map(|b| b.interface_name.clone()),
            ip_address: resource.network.as_ref().and_then(|n| n.ip_address.clone()),
            mac_address: resource.network.as_ref().and_then(|n| n.mac_address.clone()),
            cpu_cores: desired.cpu_cores,
            memory_gib: desired.memory_gib,
            disk_gib: desired.disk_gib,
            cost_per_hour_cents: hourly_cost_cents(desired.cpu_cores, desired.memory_gib),
            last_error: resource.last_error.clone(),
            created_at: resource.created_at,
            last_reconciled: resource.last_reconciled,
        }
    }
}

/// Hourly rate of a VM from `recorded_at` on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostRecord {
    pub recorded_at: DateTime<Utc>,
    pub cpu_cores: u32,
    pub memory_gib: u32,
    pub cost_per_hour_cents: u32,
}

impl CostRecord {
    fn of(resource: &ManagedResource) -> Self {
        let desired = &resource.desired;
        Self {
            recorded_at: Utc::now(),
            cpu_cores: desired.cpu_cores,
            memory_gib: desired.memory_gib,
            cost_per_hour_cents: hourly_cost_cents(desired.cpu_cores, desired.memory_gib),
        }
    }
}

/// Per-VM bookkeeping, tied to one incarnation of the VM by `created_at`
#[derive(Debug, Clone)]
struct VmLedger {
    created_at: DateTime<Utc>,
    template_id: Option<u32>,
    costs: Vec<CostRecord>,
}

/// Control plane entry points
pub struct ControlPlane {
    auth: Arc<AuthGuard>,
    reconciler: Arc<Reconciler>,
    templates: TemplateCatalog,
    default_namespace: String,
    ledgers: RwLock<HashMap<ResourceId, VmLedger>>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("default_namespace", &self.default_namespace)
            .field("templates", &self.templates.len())
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    pub fn new(
        auth: Arc<AuthGuard>,
        reconciler: Arc<Reconciler>,
        templates: TemplateCatalog,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            auth,
            reconciler,
            templates,
            default_namespace: default_namespace.into(),
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    pub fn auth(&self) -> &Arc<AuthGuard> {
        &self.auth
    }

    pub async fn create_vm(&self, token: &str, request: CreateVmRequest) -> Result<VmView, ControllerError> {
        let identity = self.auth.authenticate(token)?;
        let namespace = request
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone());
        self.auth.require(&identity, Action::Create, &namespace)?;

        let id = ResourceId::new(&namespace, &request.name);
        let spec = self.templates.resolve(
            &ResourceRequest {
                name: request.name,
                template_id: request.template_id,
                image: request.image,
                cpu_cores: request.cpu_cores,
                memory_gib: request.memory_gib,
                disk_gib: request.disk_gib,
                password: request.password,
            },
            &namespace,
        )?;

        let resource = self.reconciler.create(spec, identity.subject.clone()).await?;
        self.open_ledger(&resource, request.template_id);
        let view = VmView::from(&resource);
        info!(
            resource = %id,
            subject = %identity.subject,
            cost_per_hour_cents = view.cost_per_hour_cents,
            "VM create accepted"
        );
        Ok(view)
    }

    /// Change CPU and/or memory, clamped to the VM's template
    pub async fn resize_vm(
        &self,
        token: &str,
        namespace: &str,
        name: &str,
        request: ResizeVmRequest,
    ) -> Result<VmView, ControllerError> {
        let identity = self.auth.authenticate(token)?;
        self.auth.require(&identity, Action::Update, namespace)?;
        let resource = self.owned(&identity, &ResourceId::new(namespace, name))?;

        let template = self
            .ledgers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&resource.id)
            .filter(|ledger| ledger.created_at == resource.created_at)
            .and_then(|ledger| ledger.template_id)
            .and_then(|id| self.templates.get(id))
            .cloned();

        let mut spec = resource.desired.clone();
        if let Some(cpu) = request.cpu_cores {
            spec.cpu_cores = template.as_ref().map_or(cpu, |t| cpu.min(t.max_cpu));
        }
        if let Some(memory) = request.memory_gib {
            spec.memory_gib = template.as_ref().map_or(memory, |t| memory.min(t.max_ram));
        }

        let before = (resource.desired.cpu_cores, resource.desired.memory_gib);
        let resource = self.reconciler.update(spec).await?;
        if (resource.desired.cpu_cores, resource.desired.memory_gib) != before {
            self.record_cost(&resource);
        }
        let view = VmView::from(&resource);
        info!(
            resource = %resource.id,
            subject = %identity.subject,
            cpu_cores = view.cpu_cores,
            memory_gib = view.memory_gib,
            cost_per_hour_cents = view.cost_per_hour_cents,
            "VM resize accepted"
        );
        Ok(view)
    }

    pub async fn delete_vm(&self, token: &str, namespace: &str, name: &str) -> Result<VmView, ControllerError> {
        let identity = self.auth.authenticate(token)?;
        self.auth.require(&identity, Action::Delete, namespace)?;
        let resource = self.owned(&identity, &ResourceId::new(namespace, name))?;

        let resource = self.reconciler.delete(resource.id).await?;
        info!(resource = %resource.id, subject = %identity.subject, status = %resource.status, "VM delete accepted");
        Ok(VmView::from(&resource))
    }

    pub fn get_vm(&self, token: &str, namespace: &str, name: &str) -> Result<VmView, ControllerError> {
        let identity = self.auth.authenticate(token)?;
        self.auth.require(&identity, Action::Read, namespace)?;
        let resource = self.owned(&identity, &ResourceId::new(namespace, name))?;
        Ok(VmView::from(&resource))
    }

    /// VMs the caller may see, optionally limited to one namespace
    pub fn list_vms(&self, token: &str, namespace: Option<&str>) -> Result<Vec<VmView>, ControllerError> {
        let identity = self.auth.authenticate(token)?;
        if let Some(namespace) = namespace {
            self.auth.require(&identity, Action::Read, namespace)?;
        }
        Ok(self
            .reconciler
            .list(namespace)
            .iter()
            .filter(|r| {
                identity.is_admin()
                    || (r.owner == identity.subject
                        && self.auth.authorize(&identity, Action::Read, &r.id.namespace))
            })
            .map(VmView::from)
            .collect())
    }

    /// Cost rates of a VM, oldest first
    pub fn vm_costs(&self, token: &str, namespace: &str, name: &str) -> Result<Vec<CostRecord>, ControllerError> {
        let identity = self.auth.authenticate(token)?;
        self.auth.require(&identity, Action::Read, namespace)?;
        let resource = self.owned(&identity, &ResourceId::new(namespace, name))?;
        Ok(self
            .ledgers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&resource.id)
            .filter(|ledger| ledger.created_at == resource.created_at)
            .map(|ledger| ledger.costs.clone())
            .unwrap_or_default())
    }

    /// Snapshot a `Pending` or `Running` VM
    pub async fn create_snapshot(&self, token: &str, namespace: &str, name: &str) -> Result<SnapshotInfo, ControllerError> {
        let identity = self.auth.authenticate(token)?;
        self.auth.require(&identity, Action::Create, namespace)?;
        let resource = self.owned(&identity, &ResourceId::new(namespace, name))?;
        if !matches!(resource.status, ResourceStatus::Pending | ResourceStatus::Running) {
            return Err(ControllerError::Conflict(format!(
                "{} is {}; only Pending or Running VMs can be snapshotted",
                resource.id, resource.status
            )));
        }

        let snapshot = self.reconciler.cluster.create_snapshot(&resource.id).await?;
        info!(
            resource = %resource.id,
            subject = %identity.subject,
            snapshot = %snapshot.name,
            "VM snapshot requested"
        );
        Ok(snapshot)
    }

    /// Snapshots of one VM, oldest first
    pub async fn list_snapshots(&self, token: &str, namespace: &str, name: &str) -> Result<Vec<SnapshotInfo>, ControllerError> {
        let identity = self.auth.authenticate(token)?;
        self.auth.require(&identity, Action::Read, namespace)?;
        let resource = self.owned(&identity, &ResourceId::new(namespace, name))?;
        Ok(self.reconciler.cluster.list_snapshots(&resource.id).await?)
    }

    pub async fn get_snapshot(
        &self,
        token: &str,
        namespace: &str,
        name: &str,
        snapshot: &str,
    ) -> Result<SnapshotInfo, ControllerError> {
        let identity = self.auth.authenticate(token)?;
        self.auth.require(&identity, Action::Read, namespace)?;
        let resource = self.owned(&identity, &ResourceId::new(namespace, name))?;
        self.snapshot_of(&resource, snapshot).await
    }

    pub async fn delete_snapshot(
        &self,
        token: &str,
        namespace: &str,
        name: &str,
        snapshot: &str,
    ) -> Result<(), ControllerError> {
        let identity = self.auth.authenticate(token)?;
        self.auth.require(&identity, Action::Delete, namespace)?;
        let resource = self.owned(&identity, &ResourceId::new(namespace, name))?;
        let snapshot = self.snapshot_of(&resource, snapshot).await?;

        self.reconciler
            .cluster
            .delete_snapshot(&snapshot.namespace, &snapshot.name)
            .await?;
        info!(
            resource = %resource.id,
            subject = %identity.subject,
            snapshot = %snapshot.name,
            "VM snapshot deleted"
        );
        Ok(())
    }

    /// Revoke the caller's token
    pub fn logout(&self, token: &str) -> Result<(), ControllerError> {
        self.auth.revoke(token)
    }

    /// Drop ledgers of VMs the reconciler no longer tracks
    pub fn prune(&self) -> usize {
        let mut ledgers = self.ledgers.write().unwrap_or_else(PoisonError::into_inner);
        let before = ledgers.len();
        ledgers.retain(|id, _| self.reconciler.status(id).is_some());
        let pruned = before - ledgers.len();
        if pruned > 0 {
            debug!(pruned, "Pruned VM ledgers");
        }
        pruned
    }

    /// Start a ledger for a newly created VM; a repeated create keeps the existing one
    fn open_ledger(&self, resource: &ManagedResource, template_id: Option<u32>) {
        let mut ledgers = self.ledgers.write().unwrap_or_else(PoisonError::into_inner);
        if ledgers
            .get(&resource.id)
            .is_some_and(|ledger| ledger.created_at == resource.created_at)
        {
            return;
        }
        ledgers.insert(
            resource.id.clone(),
            VmLedger {
                created_at: resource.created_at,
                template_id,
                costs: vec![CostRecord::of(resource)],
            },
        );
    }

    fn record_cost(&self, resource: &ManagedResource) {
        let mut ledgers = self.ledgers.write().unwrap_or_else(PoisonError::into_inner);
        match ledgers.get_mut(&resource.id) {
            Some(ledger) if ledger.created_at == resource.created_at => ledger.costs.push(CostRecord::of(resource)),
            // Adopted VMs start their ledger at the first resize
            _ => {
                ledgers.insert(
                    resource.id.clone(),
                    VmLedger {
                        created_at: resource.created_at,
                        template_id: None,
                        costs: vec![CostRecord::of(resource)],
                    },
                );
            }
        }
    }

    async fn snapshot_of(&self, resource: &ManagedResource, snapshot: &str) -> Result<SnapshotInfo, ControllerError> {
        let not_found = || ControllerError::NotFound(format!("snapshot {snapshot} of {}", resource.id));
        let info = self
            .reconciler
            .cluster
            .get_snapshot(&resource.id.namespace, snapshot)
            .await?
            .ok_or_else(not_found)?;
        if info.source != resource.id.name {
            return Err(not_found());
        }
        Ok(info)
    }

    fn owned(&self, identity: &Identity, id: &ResourceId) -> Result<ManagedResource, ControllerError> {
        let resource = self
            .reconciler
            .status(id)
            .ok_or_else(|| ControllerError::NotFound(id.to_string()))?;
        if !identity.is_admin() && resource.owner != identity.subject {
            return Err(ControllerError::Forbidden(format!(
                "'{}' does not own {id}",
                identity.subject
            )));
        }
        Ok(resource)
    }
}
