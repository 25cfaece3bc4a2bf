//! KubeVirt Cluster Client
//!
//! The adapter between the VM controller and the Kubernetes API server.
//! Provides typed operations on KubeVirt `VirtualMachine` objects, a
//! restartable namespace watch loop built on `kube::runtime::watcher`,
//! snapshot operations, and a typed failure taxonomy.
//!
//! # Example
//!
//! ```no_run
//! use kubevirt_client::{ClusterClientTrait, ClusterSettings, KubeVirtClient, ManifestOptions, RetryConfig, ResourceSpec};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeVirtClient::new(ClusterSettings {
//!     api_url: "https://k8s.example.com:6443".to_string(),
//!     token: "service-account-token".to_string(),
//!     insecure_tls: false,
//!     default_namespace: "vms".to_string(),
//!     manifest: ManifestOptions {
//!         bridge: "br0".to_string(),
//!         storage_class: "standard".to_string(),
//!         node: None,
//!     },
//!     retry: RetryConfig::default(),
//! })?;
//!
//! let spec = ResourceSpec {
//!     name: "web-1".to_string(),
//!     namespace: "vms".to_string(),
//!     image: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img".to_string(),
//!     cpu_cores: 2,
//!     memory_gib: 4,
//!     disk_gib: 20,
//!     credentials: None,
//! };
//!
//! // Applying twice is safe: the second call returns the existing handle
//! let handle = client.apply(&spec, "alice").await?;
//! assert!(client.apply(&spec, "alice").await?.id == handle.id);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Idempotent apply**: spec hash annotation decides create / no-op / conflict
//! - **Watch loop**: framed relists with a completion marker, resume after disconnects
//! - **Snapshots**: `VirtualMachineSnapshot` create / list / get / delete
//! - **Retry Logic**: transient failures retried with exponential backoff
//! - **Mocking**: in-memory cluster behind the `test-util` feature

pub mod backoff;
pub mod client;
pub mod error;
pub mod manifest;
pub mod models;
pub mod retry;
#[path = "trait.rs"]
pub mod cluster_trait;
pub mod watch;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use backoff::ExponentialBackoff;
pub use client::{ClusterSettings, KubeVirtClient};
pub use cluster_trait::{ClusterClientTrait, WatchStream};
pub use error::ClusterError;
pub use manifest::ManifestOptions;
pub use models::*;
pub use retry::RetryConfig;
pub use watch::{NamespaceWatcher, WatchSettings};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockClusterClient, MockOperation};
