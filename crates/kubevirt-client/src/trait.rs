//! ClusterClient trait for mocking
//!
//! This trait abstracts the KubeVirt client so the reconciler and watch loop
//! can be unit tested against an in-memory cluster.

use crate::error::ClusterError;
use crate::models::*;
use crate::watch::WatchSettings;
use futures::stream::BoxStream;

/// Long-lived watch over one namespace
pub type WatchStream = BoxStream<'static, Result<WatchItem, ClusterError>>;

/// Trait for KubeVirt cluster operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    /// Check the bearer token against the API server
    async fn validate_token(&self) -> Result<(), ClusterError>;

    /// Create the VM unless an identical one already exists
    ///
    /// Same id with the same spec hash returns the existing handle with
    /// `created = false`; same id with a different hash is a `Conflict`.
    async fn apply(&self, spec: &ResourceSpec, owner: &str) -> Result<ResourceHandle, ClusterError>;

    /// Overwrite the spec of an existing VM
    async fn replace(&self, spec: &ResourceSpec, owner: &str) -> Result<ResourceHandle, ClusterError>;

    /// Restart the VM so spec changes take effect in the guest
    async fn restart(&self, id: &ResourceId) -> Result<(), ClusterError>;

    /// Delete the VM; `NotFound` when it does not exist
    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError>;

    async fn get(&self, id: &ResourceId) -> Result<Option<ObservedState>, ClusterError>;

    /// List managed VMs in a namespace together with the collection version
    async fn list(&self, namespace: &str) -> Result<ListSnapshot, ClusterError>;

    /// Interface the cluster assigned to the running instance, if any yet
    async fn network_identity(&self, id: &ResourceId) -> Result<Option<NetworkIdentity>, ClusterError>;

    /// Watch the managed VMs of `namespace` for as long as the stream is polled
    ///
    /// The stream opens with a framed list (see [`WatchItem`]), then follows
    /// live changes. Failures are yielded in-stream and the stream carries on
    /// after a backoff bounded by `settings`: a dropped connection resumes
    /// from the last seen version, an expired version starts a new framed list.
    fn watch(&self, namespace: &str, settings: WatchSettings) -> WatchStream;

    /// Take a snapshot of the VM; the name is generated
    async fn create_snapshot(&self, vm: &ResourceId) -> Result<SnapshotInfo, ClusterError>;

    /// Snapshots taken of `vm` by this controller, oldest first
    async fn list_snapshots(&self, vm: &ResourceId) -> Result<Vec<SnapshotInfo>, ClusterError>;

    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<Option<SnapshotInfo>, ClusterError>;

    /// Delete a snapshot; `NotFound` when it does not exist
    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
