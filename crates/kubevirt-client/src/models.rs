//! Cluster client models
//!
//! These are the controller-facing shapes of KubeVirt objects. The raw
//! `VirtualMachine` / `VirtualMachineInstance` types live in the `crds` crate;
//! [`crate::manifest`] converts between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Maximum length of a Kubernetes object name used as a DNS label
const MAX_NAME_LEN: usize = 63;

/// Stable identifier of a managed resource: `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Guest login credentials injected through cloud-init
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCredentials {
    pub password: String,
}

impl fmt::Debug for GuestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCredentials")
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Desired configuration of a virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub namespace: String,
    /// Root disk image URL imported through a DataVolume
    pub image: String,
    pub cpu_cores: u32,
    pub memory_gib: u32,
    pub disk_gib: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<GuestCredentials>,
}

impl ResourceSpec {
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.namespace, &self.name)
    }

    /// The comparable part of the spec (what drift detection looks at)
    #[must_use]
    pub fn fingerprint(&self) -> SpecFingerprint {
        SpecFingerprint {
            image: self.image.clone(),
            cpu_cores: self.cpu_cores,
            memory_gib: self.memory_gib,
            disk_gib: self.disk_gib,
        }
    }

    /// Hex SHA-256 of the fingerprint, stored on the object for idempotent apply
    ///
    /// Credentials are not part of the hash.
    #[must_use]
    pub fn spec_hash(&self) -> String {
        self.fingerprint().hash()
    }

    /// Check the spec is something the cluster will accept
    pub fn validate(&self) -> Result<(), String> {
        validate_dns_label("name", &self.name)?;
        validate_dns_label("namespace", &self.namespace)?;
        if self.image.trim().is_empty() {
            return Err("image must not be empty".to_string());
        }
        if self.cpu_cores == 0 {
            return Err("cpu_cores must be at least 1".to_string());
        }
        if self.memory_gib == 0 {
            return Err("memory_gib must be at least 1".to_string());
        }
        if self.disk_gib == 0 {
            return Err("disk_gib must be at least 1".to_string());
        }
        Ok(())
    }
}

fn validate_dns_label(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(format!("{field} must be 1-{MAX_NAME_LEN} characters"));
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = !value.starts_with('-') && !value.ends_with('-');
    if !valid_chars || !valid_edges {
        return Err(format!(
            "{field} '{value}' must consist of lowercase alphanumerics or '-', and start and end with an alphanumeric"
        ));
    }
    Ok(())
}

/// Comparable spec attributes, desired or observed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecFingerprint {
    pub image: String,
    pub cpu_cores: u32,
    pub memory_gib: u32,
    pub disk_gib: u32,
}

impl SpecFingerprint {
    #[must_use]
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.image.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.cpu_cores.to_be_bytes());
        hasher.update(self.memory_gib.to_be_bytes());
        hasher.update(self.disk_gib.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Coarse phase derived from the KubeVirt printable status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterPhase {
    /// Scheduling, importing the disk, or booting
    Provisioning,
    /// Running and reporting ready
    Ready,
    /// Running but not ready
    NotReady,
    /// Halted or being stopped
    Stopped,
    /// Terminal error reported by KubeVirt
    Failed,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterPhase::Provisioning => "Provisioning",
            ClusterPhase::Ready => "Ready",
            ClusterPhase::NotReady => "NotReady",
            ClusterPhase::Stopped => "Stopped",
            ClusterPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// What the cluster reports about one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Observed spec; `None` when the object could not be interpreted
    pub fingerprint: Option<SpecFingerprint>,
    pub phase: ClusterPhase,
    /// KubeVirt `printableStatus`, passed through for display
    pub printable_status: String,
    pub resource_version: Option<String>,
    pub spec_hash: Option<String>,
    pub owner: Option<String>,
    pub uid: Option<String>,
    /// Carries the managed-by label of this controller
    pub managed: bool,
}

/// Result of a successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub id: ResourceId,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    /// `false` when an identical object already existed
    pub created: bool,
}

/// Cluster-assigned network identity of a running VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    /// Name of the link in the host network namespace that carries the VM's
    /// traffic, as published in the VMI interface status
    pub interface_name: String,
    pub network_name: Option<String>,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
}

/// Point-in-time list of managed objects in a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSnapshot {
    /// Collection resource version to start a watch from
    pub resource_version: String,
    pub items: Vec<(ResourceId, ObservedState)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatchEventKind::Added => "Added",
            WatchEventKind::Modified => "Modified",
            WatchEventKind::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// One item from a namespace watch stream
///
/// Every (re)list is framed: `Restarted`, one `Listed` per object, then
/// `Synced`. Live changes follow as `Event`s until the next relist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchItem {
    /// A relist began
    Restarted,
    /// Object present when the namespace was listed
    Listed { id: ResourceId, observed: ObservedState },
    /// The relist is complete
    Synced,
    Event {
        kind: WatchEventKind,
        id: ResourceId,
        observed: ObservedState,
    },
}

/// Change notification delivered to the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_id: Uuid,
    pub id: ResourceId,
    pub kind: WatchEventKind,
    pub observed: ObservedState,
    pub timestamp: DateTime<Utc>,
    /// Emitted by a relist rather than the live stream
    pub synthetic: bool,
}

impl WatchEvent {
    #[must_use]
    pub fn new(kind: WatchEventKind, id: ResourceId, observed: ObservedState) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            id,
            kind,
            observed,
            timestamp: Utc::now(),
            synthetic: false,
        }
    }

    #[must_use]
    pub fn synthetic(id: ResourceId, observed: ObservedState) -> Self {
        Self {
            synthetic: true,
            ..Self::new(WatchEventKind::Added, id, observed)
        }
    }
}

/// What a namespace watcher hands to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchUpdate {
    Event(WatchEvent),
    /// A relist of `namespace` finished; `listed` is every object it returned
    ///
    /// Objects known to the consumer but absent here may have been deleted
    /// while the watch was down.
    Resynced {
        namespace: String,
        listed: BTreeSet<ResourceId>,
    },
}

/// A `VirtualMachineSnapshot` taken of a managed VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub namespace: String,
    /// Name of the snapshotted VM
    pub source: String,
    /// KubeVirt snapshot phase ("InProgress", "Succeeded", "Failed"), once reported
    pub phase: Option<String>,
    pub ready_to_use: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ResourceSpec {
        ResourceSpec {
            name: "web-1".to_string(),
            namespace: "vms".to_string(),
            image: "https://images.example.com/ubuntu.img".to_string(),
            cpu_cores: 2,
            memory_gib: 4,
            disk_gib: 20,
            credentials: None,
        }
    }

    #[test]
    fn test_spec_hash_ignores_credentials() {
        let plain = spec();
        let mut with_password = spec();
        with_password.credentials = Some(GuestCredentials {
            password: "hunter2".to_string(),
        });
        assert_eq!(plain.spec_hash(), with_password.spec_hash());
        assert_eq!(plain.spec_hash().len(), 64);
    }

    #[test]
    fn test_spec_hash_changes_with_resources() {
        let mut bigger = spec();
        bigger.cpu_cores = 4;
        assert_ne!(spec().spec_hash(), bigger.spec_hash());
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let mut s = spec();
        s.name = "Web_1".to_string();
        assert!(s.validate().is_err());

        s.name = "-web".to_string();
        assert!(s.validate().is_err());

        s.name = "a".repeat(64);
        assert!(s.validate().is_err());

        s.name = "web-1".to_string();
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_resources() {
        let mut s = spec();
        s.memory_gib = 0;
        assert!(s.validate().unwrap_err().contains("memory_gib"));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = GuestCredentials {
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_resource_id_display() {
        assert_eq!(ResourceId::new("vms", "web-1").to_string(), "vms/web-1");
    }
}
