//! VirtualMachineInstance (kubevirt.io/v1)
//!
//! The running instance KubeVirt creates for a started VM. The controller only
//! reads it, to learn the cluster-assigned network identity.

use crate::virtual_machine::VirtualMachineInstanceSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Wrapper so the VMI kind can reuse the VM template spec
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    namespaced,
    status = "VirtualMachineInstanceStatus",
    shortname = "vmi"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceBody {
    #[serde(flatten)]
    pub spec: VirtualMachineInstanceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    /// Phase ("Pending", "Scheduling", "Scheduled", "Running", "Succeeded", "Failed")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<VmiInterfaceStatus>,
}

/// Interface as reported by the guest agent / virt-handler
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmiInterfaceStatus {
    /// Network name from the VM spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Interface name on the guest/host side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_interfaces() {
        let json = serde_json::json!({
            "phase": "Running",
            "nodeName": "node-a",
            "interfaces": [{
                "name": "default",
                "interfaceName": "eth0",
                "mac": "02:00:00:00:00:01",
                "ipAddress": "10.0.0.12"
            }]
        });

        let status: VirtualMachineInstanceStatus = serde_json::from_value(json).unwrap();
        assert_eq!(status.node_name.as_deref(), Some("node-a"));
        assert_eq!(status.interfaces.len(), 1);
        assert_eq!(status.interfaces[0].interface_name.as_deref(), Some("eth0"));
        assert_eq!(status.interfaces[0].ip_address.as_deref(), Some("10.0.0.12"));
    }
}
