//! Test utilities for unit testing the reconciler and the control plane
//!
//! This module provides helpers for creating test data and wiring the
//! reconciler to in-memory cluster and host mocks.

#[cfg(test)]
use crate::bridge::BridgeCoordinator;
#[cfg(test)]
use crate::config::Config;
#[cfg(test)]
use crate::reconciler::Reconciler;
#[cfg(test)]
use hostnet_client::MockHostNetwork;
#[cfg(test)]
use kubevirt_client::{MockClusterClient, NetworkIdentity, ResourceSpec};
#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Arc;

/// Configuration with test defaults (secret `test-secret`, namespace `vms`)
#[cfg(test)]
pub fn test_config() -> Config {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("KUBERNETES_API_URL", "https://127.0.0.1:6443"),
        ("KUBERNETES_TOKEN", "sa-token"),
        ("NAMESPACE", "vms"),
        ("BRIDGE", "br0"),
        ("INTERFACE", "eno1"),
        ("SECRET_KEY", "test-secret"),
        ("ALGORITHM", "HS256"),
        ("ACCESS_TOKEN_EXPIRE_MINUTES", "30"),
        ("BRIDGE_CAPACITY", "8"),
        ("MAX_RECONCILE_ATTEMPTS", "2"),
    ]);
    Config::from_lookup(|key| vars.get(key).map(|v| (*v).to_string())).unwrap()
}

/// Helper to create a test spec in namespace `vms`
#[cfg(test)]
pub fn create_test_spec(name: &str) -> ResourceSpec {
    ResourceSpec {
        name: name.to_string(),
        namespace: "vms".to_string(),
        image: "https://images.example.com/ubuntu.img".to_string(),
        cpu_cores: 2,
        memory_gib: 4,
        disk_gib: 20,
        credentials: None,
    }
}

/// Helper to create a network identity for a host tap device
#[cfg(test)]
pub fn create_test_identity(interface: &str) -> NetworkIdentity {
    NetworkIdentity {
        interface_name: interface.to_string(),
        network_name: Some("br0".to_string()),
        mac_address: Some("02:00:00:00:00:01".to_string()),
        ip_address: Some("10.0.0.10".to_string()),
    }
}

/// Reconciler wired to mocks, with the mocks kept for inspection
#[cfg(test)]
pub struct TestHarness {
    pub reconciler: Arc<Reconciler>,
    pub cluster: MockClusterClient,
    pub host: MockHostNetwork,
    pub bridge: Arc<BridgeCoordinator>,
}

/// Create a harness whose host already has `br0` and `eno1`
#[cfg(test)]
pub fn create_test_harness(max_reconcile_attempts: u32) -> TestHarness {
    let cluster = MockClusterClient::new();
    let host = MockHostNetwork::new();
    host.add_link("br0");
    host.add_link("eno1");
    let bridge = Arc::new(BridgeCoordinator::new(Arc::new(host.clone()), "br0", "eno1", 8));
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(cluster.clone()),
        Arc::clone(&bridge),
        max_reconcile_attempts,
    ));
    TestHarness {
        reconciler,
        cluster,
        host,
        bridge,
    }
}
