//! VirtualMachineSnapshot (snapshot.kubevirt.io/v1beta1)
//!
//! Point-in-time copy of a VM's disks. The controller creates, lists and
//! deletes these on behalf of the VM owner.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineSnapshot",
    namespaced,
    status = "VirtualMachineSnapshotStatus",
    shortname = "vmsnapshot"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotSpec {
    pub source: SnapshotSource,
}

/// Typed local reference to the snapshotted object
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

impl SnapshotSource {
    /// Reference to a `kubevirt.io` VirtualMachine
    pub fn virtual_machine(name: impl Into<String>) -> Self {
        Self {
            api_group: Some("kubevirt.io".to_string()),
            kind: "VirtualMachine".to_string(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotStatus {
    /// "InProgress", "Succeeded", "Failed" or "Unknown"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// RFC 3339 time the snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_serializes_as_typed_reference() {
        let spec = VirtualMachineSnapshotSpec {
            source: SnapshotSource::virtual_machine("web-1"),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["source"]["apiGroup"], "kubevirt.io");
        assert_eq!(json["source"]["kind"], "VirtualMachine");
        assert_eq!(json["source"]["name"], "web-1");
    }

    #[test]
    fn test_deserialize_status() {
        let json = serde_json::json!({
            "phase": "Failed",
            "readyToUse": false,
            "creationTime": "2026-01-02T03:04:05Z",
            "error": { "message": "volume snapshot class missing" }
        });

        let status: VirtualMachineSnapshotStatus = serde_json::from_value(json).unwrap();
        assert_eq!(status.phase.as_deref(), Some("Failed"));
        assert_eq!(status.ready_to_use, Some(false));
        assert_eq!(
            status.error.and_then(|e| e.message).as_deref(),
            Some("volume snapshot class missing")
        );
    }
}
