//! Integration tests for the KubeVirt client
//!
//! These tests require a cluster with KubeVirt and CDI installed.
//! Set KUBERNETES_API_URL, KUBERNETES_TOKEN and NAMESPACE to run.

use futures::StreamExt;
use kubevirt_client::{
    ClusterClientTrait, ClusterError, ClusterSettings, KubeVirtClient, ManifestOptions,
    ResourceId, ResourceSpec, RetryConfig, WatchItem, WatchSettings,
};

fn client() -> (KubeVirtClient, String) {
    let url = std::env::var("KUBERNETES_API_URL")
        .unwrap_or_else(|_| "https://localhost:6443".to_string());
    let token = std::env::var("KUBERNETES_TOKEN")
        .expect("KUBERNETES_TOKEN environment variable must be set");
    let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());

    let client = KubeVirtClient::new(ClusterSettings {
        api_url: url,
        token,
        insecure_tls: std::env::var("KUBERNETES_INSECURE_TLS").is_ok_and(|v| v == "true"),
        default_namespace: namespace.clone(),
        manifest: ManifestOptions {
            bridge: std::env::var("BRIDGE").unwrap_or_else(|_| "br0".to_string()),
            storage_class: "standard".to_string(),
            node: None,
        },
        retry: RetryConfig::default(),
    })
    .expect("Failed to create client");
    (client, namespace)
}

fn test_spec(namespace: &str) -> ResourceSpec {
    ResourceSpec {
        name: "vm-controller-it".to_string(),
        namespace: namespace.to_string(),
        image: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"
            .to_string(),
        cpu_cores: 1,
        memory_gib: 1,
        disk_gib: 5,
        credentials: None,
    }
}

#[tokio::test]
#[ignore] // Requires running cluster
async fn test_validate_token() {
    let (client, _) = client();
    assert!(client.validate_token().await.is_ok(), "Token was rejected");
}

#[tokio::test]
#[ignore]
async fn test_list_virtual_machines() {
    let (client, namespace) = client();
    let snapshot = client
        .list(&namespace)
        .await
        .expect("Failed to list virtual machines");

    println!(
        "Found {} managed VMs at version {}",
        snapshot.items.len(),
        snapshot.resource_version
    );
}

#[tokio::test]
#[ignore]
async fn test_apply_twice_then_delete() {
    let (client, namespace) = client();
    let spec = test_spec(&namespace);

    let first = client.apply(&spec, "integration").await.expect("Failed to apply");
    let second = client.apply(&spec, "integration").await.expect("Failed to re-apply");
    assert_eq!(first.uid, second.uid);
    assert!(!second.created);

    let mut bigger = spec.clone();
    bigger.cpu_cores = 2;
    assert!(matches!(
        client.apply(&bigger, "integration").await,
        Err(ClusterError::Conflict(_))
    ));

    client.delete(&spec.id()).await.expect("Failed to delete");
    assert!(matches!(
        client.delete(&spec.id()).await,
        Err(ClusterError::NotFound(_))
    ));
}

#[tokio::test]
#[ignore]
async fn test_watch_lists_then_follows() {
    let (client, namespace) = client();
    let mut stream = client.watch(&namespace, WatchSettings::default());

    // The initial list is framed before any live event
    assert!(matches!(stream.next().await, Some(Ok(WatchItem::Restarted))));
    loop {
        match stream.next().await.expect("watch ended during the initial list") {
            Ok(WatchItem::Synced) => break,
            Ok(WatchItem::Listed { .. }) => {}
            other => panic!("unexpected item during the initial list: {other:?}"),
        }
    }

    let spec = test_spec(&namespace);
    client.apply(&spec, "integration").await.expect("Failed to apply");

    while let Some(item) = stream.next().await {
        if let Ok(WatchItem::Event { id, .. }) = item {
            if id == ResourceId::new(namespace.clone(), spec.name.clone()) {
                break;
            }
        }
    }

    let snapshot = client.create_snapshot(&spec.id()).await.expect("Failed to snapshot");
    let listed = client.list_snapshots(&spec.id()).await.expect("Failed to list snapshots");
    assert!(listed.iter().any(|s| s.name == snapshot.name));
    client
        .delete_snapshot(&namespace, &snapshot.name)
        .await
        .expect("Failed to delete snapshot");

    client.delete(&spec.id()).await.expect("Failed to delete");
}
