//! KubeVirt API client
//!
//! Talks to the API server through `kube::Api<VirtualMachine>`,
//! `kube::Api<VirtualMachineInstance>` and `kube::Api<VirtualMachineSnapshot>`.
//! Every request/response operation is wrapped in [`retry_transient`] so that
//! short API server outages never reach callers. Watches go through
//! `kube::runtime::watcher`, which handles resume and relist itself.

use crate::backoff::ExponentialBackoff;
use crate::cluster_trait::{ClusterClientTrait, WatchStream};
use crate::error::ClusterError;
use crate::manifest::{self, ManifestOptions};
use crate::models::*;
use crate::retry::{RetryConfig, retry_transient};
use crate::watch::WatchSettings;
use crds::labels::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, SNAPSHOT_SOURCE_LABEL, SPEC_HASH_ANNOTATION};
use crds::{VirtualMachine, VirtualMachineInstance, VirtualMachineSnapshot};
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use std::fmt;
use tracing::{debug, info};

/// Server-side watch timeout; the watcher re-opens the watch after it
const WATCH_TIMEOUT_SECONDS: u32 = 290;

/// Connection and manifest settings for [`KubeVirtClient::new`]
#[derive(Clone)]
pub struct ClusterSettings {
    pub api_url: String,
    pub token: String,
    pub insecure_tls: bool,
    pub default_namespace: String,
    pub manifest: ManifestOptions,
    pub retry: RetryConfig,
}

impl fmt::Debug for ClusterSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSettings")
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .field("insecure_tls", &self.insecure_tls)
            .field("default_namespace", &self.default_namespace)
            .field("manifest", &self.manifest)
            .field("retry", &self.retry)
            .finish()
    }
}

/// KubeVirt client backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeVirtClient {
    client: kube::Client,
    default_namespace: String,
    manifest: ManifestOptions,
    retry: RetryConfig,
}

impl KubeVirtClient {
    /// Create a client for an explicit API URL and bearer token
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the URL does not parse or the HTTP client
    /// cannot be built. Must be called from within a Tokio runtime.
    pub fn new(settings: ClusterSettings) -> Result<Self, ClusterError> {
        let cluster_url: http::Uri = settings.api_url.parse().map_err(|e: http::uri::InvalidUri| {
            ClusterError::InvalidConfig(format!("invalid API URL '{}': {}", settings.api_url, e))
        })?;

        let mut config = kube::Config::new(cluster_url);
        config.default_namespace = settings.default_namespace.clone();
        config.accept_invalid_certs = settings.insecure_tls;
        config.auth_info.token = Some(settings.token.clone().into());

        let client = kube::Client::try_from(config)
            .map_err(|e| ClusterError::InvalidConfig(e.to_string()))?;

        Ok(Self::from_client(
            client,
            settings.default_namespace,
            settings.manifest,
            settings.retry,
        ))
    }

    /// Wrap an existing `kube::Client`
    #[must_use]
    pub fn from_client(
        client: kube::Client,
        default_namespace: String,
        manifest: ManifestOptions,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            default_namespace,
            manifest,
            retry,
        }
    }

    fn vms(&self, namespace: &str) -> Api<VirtualMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn vmis(&self, namespace: &str) -> Api<VirtualMachineInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn snapshots(&self, namespace: &str) -> Api<VirtualMachineSnapshot> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create_snapshot_once(&self, vm: &ResourceId, name: &str) -> Result<SnapshotInfo, ClusterError> {
        let api = self.snapshots(&vm.namespace);
        let snapshot = manifest::build_snapshot(vm, name);
        match api.create(&PostParams::default(), &snapshot).await {
            Ok(created) => Ok(manifest::observe_snapshot(&created)),
            Err(e) => match ClusterError::from(e) {
                // An earlier attempt went through before the connection dropped
                ClusterError::Conflict(_) => Ok(manifest::observe_snapshot(&api.get(name).await?)),
                other => Err(other),
            },
        }
    }

    async fn apply_once(&self, spec: &ResourceSpec, owner: &str) -> Result<ResourceHandle, ClusterError> {
        let id = spec.id();
        let api = self.vms(&id.namespace);
        let desired_hash = spec.spec_hash();

        if let Some(existing) = api.get_opt(&id.name).await? {
            return existing_handle(&id, &existing, &desired_hash);
        }

        let vm = manifest::build_virtual_machine(spec, owner, &self.manifest);
        match api.create(&PostParams::default(), &vm).await {
            Ok(created) => {
                info!(resource = %id, "Created VirtualMachine");
                Ok(handle(id, &created, true))
            }
            Err(e) => match ClusterError::from(e) {
                // Lost a create race; whoever won decides
                ClusterError::Conflict(_) => {
                    let existing = api.get(&id.name).await?;
                    existing_handle(&id, &existing, &desired_hash)
                }
                other => Err(other),
            },
        }
    }

    async fn replace_once(&self, spec: &ResourceSpec, owner: &str) -> Result<ResourceHandle, ClusterError> {
        let id = spec.id();
        let api = self.vms(&id.namespace);

        let existing = api
            .get_opt(&id.name)
            .await?
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;

        let mut vm = manifest::build_virtual_machine(spec, owner, &self.manifest);
        vm.metadata.resource_version = existing.metadata.resource_version.clone();

        let replaced = api.replace(&id.name, &PostParams::default(), &vm).await?;
        info!(resource = %id, "Replaced VirtualMachine spec");
        Ok(handle(id, &replaced, false))
    }

    async fn restart_once(&self, id: &ResourceId) -> Result<(), ClusterError> {
        let path = format!(
            "/apis/subresources.kubevirt.io/v1/namespaces/{}/virtualmachines/{}/restart",
            id.namespace, id.name
        );
        let request = http::Request::put(path)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(b"{}".to_vec())
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        self.client.request_text(request).await?;
        Ok(())
    }

    async fn list_once(&self, namespace: &str) -> Result<ListSnapshot, ClusterError> {
        let params = ListParams::default().labels(&managed_selector());
        let list = self.vms(namespace).list(&params).await?;

        let items = list
            .items
            .iter()
            .filter_map(|vm| Some((resource_id(namespace, vm)?, manifest::observe(vm))))
            .collect();

        Ok(ListSnapshot {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items,
        })
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for KubeVirtClient {
    async fn validate_token(&self) -> Result<(), ClusterError> {
        let params = ListParams::default().limit(1);
        retry_transient(&self.retry, "validate_token", || async {
            self.vms(&self.default_namespace).list(&params).await?;
            Ok(())
        })
        .await
    }

    async fn apply(&self, spec: &ResourceSpec, owner: &str) -> Result<ResourceHandle, ClusterError> {
        retry_transient(&self.retry, "apply", || self.apply_once(spec, owner)).await
    }

    async fn replace(&self, spec: &ResourceSpec, owner: &str) -> Result<ResourceHandle, ClusterError> {
        match retry_transient(&self.retry, "replace", || self.replace_once(spec, owner)).await {
            // Stale resourceVersion: re-read once and try again
            Err(ClusterError::Conflict(msg)) => {
                debug!(resource = %spec.id(), conflict = %msg, "Replace conflicted, retrying with fresh version");
                retry_transient(&self.retry, "replace", || self.replace_once(spec, owner)).await
            }
            other => other,
        }
    }

    async fn restart(&self, id: &ResourceId) -> Result<(), ClusterError> {
        retry_transient(&self.retry, "restart", || self.restart_once(id)).await?;
        info!(resource = %id, "Restarted VirtualMachine");
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        retry_transient(&self.retry, "delete", || async {
            self.vms(&id.namespace)
                .delete(&id.name, &DeleteParams::default())
                .await?;
            Ok(())
        })
        .await?;
        info!(resource = %id, "Deleted VirtualMachine");
        Ok(())
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<ObservedState>, ClusterError> {
        retry_transient(&self.retry, "get", || async {
            let vm = self.vms(&id.namespace).get_opt(&id.name).await?;
            Ok(vm.as_ref().map(manifest::observe))
        })
        .await
    }

    async fn list(&self, namespace: &str) -> Result<ListSnapshot, ClusterError> {
        retry_transient(&self.retry, "list", || self.list_once(namespace)).await
    }

    async fn network_identity(&self, id: &ResourceId) -> Result<Option<NetworkIdentity>, ClusterError> {
        retry_transient(&self.retry, "network_identity", || async {
            let vmi = self.vmis(&id.namespace).get_opt(&id.name).await?;
            Ok(vmi.as_ref().and_then(manifest::network_identity))
        })
        .await
    }

    fn watch(&self, namespace: &str, settings: WatchSettings) -> WatchStream {
        let config = watcher::Config::default()
            .labels(&managed_selector())
            .timeout(WATCH_TIMEOUT_SECONDS);
        let backoff = ExponentialBackoff::new(settings.backoff_min, settings.backoff_max);
        let namespace = namespace.to_string();

        watcher(self.vms(&namespace), config)
            .backoff(backoff)
            .map(move |event| translate(&namespace, event))
            .boxed()
    }

    async fn create_snapshot(&self, vm: &ResourceId) -> Result<SnapshotInfo, ClusterError> {
        let name = manifest::snapshot_name(&vm.name);
        let snapshot =
            retry_transient(&self.retry, "create_snapshot", || self.create_snapshot_once(vm, &name)).await?;
        info!(resource = %vm, snapshot = %snapshot.name, "Created VirtualMachineSnapshot");
        Ok(snapshot)
    }

    async fn list_snapshots(&self, vm: &ResourceId) -> Result<Vec<SnapshotInfo>, ClusterError> {
        let params = ListParams::default().labels(&format!(
            "{},{SNAPSHOT_SOURCE_LABEL}={}",
            managed_selector(),
            vm.name
        ));
        retry_transient(&self.retry, "list_snapshots", || async {
            let list = self.snapshots(&vm.namespace).list(&params).await?;
            let mut snapshots: Vec<SnapshotInfo> = list.items.iter().map(manifest::observe_snapshot).collect();
            snapshots.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
            Ok(snapshots)
        })
        .await
    }

    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<Option<SnapshotInfo>, ClusterError> {
        retry_transient(&self.retry, "get_snapshot", || async {
            let snapshot = self.snapshots(namespace).get_opt(name).await?;
            Ok(snapshot.as_ref().map(manifest::observe_snapshot))
        })
        .await
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        retry_transient(&self.retry, "delete_snapshot", || async {
            self.snapshots(namespace)
                .delete(name, &DeleteParams::default())
                .await?;
            Ok(())
        })
        .await?;
        info!(namespace, snapshot = name, "Deleted VirtualMachineSnapshot");
        Ok(())
    }
}

fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}

fn resource_id(namespace: &str, vm: &VirtualMachine) -> Option<ResourceId> {
    let name = vm.metadata.name.clone()?;
    let namespace = vm
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| namespace.to_string());
    Some(ResourceId::new(namespace, name))
}

fn handle(id: ResourceId, vm: &VirtualMachine, created: bool) -> ResourceHandle {
    ResourceHandle {
        id,
        uid: vm.metadata.uid.clone(),
        resource_version: vm.metadata.resource_version.clone(),
        created,
    }
}

fn existing_handle(
    id: &ResourceId,
    existing: &VirtualMachine,
    desired_hash: &str,
) -> Result<ResourceHandle, ClusterError> {
    let current = existing
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNOTATION));

    if current.map(String::as_str) == Some(desired_hash) {
        debug!(resource = %id, "VirtualMachine already exists with identical spec");
        Ok(handle(id.clone(), existing, false))
    } else {
        Err(ClusterError::Conflict(format!(
            "{id} already exists with a different spec"
        )))
    }
}

/// Map a `kube::runtime::watcher` event onto the framed watch items
///
/// The watcher does not tell creations from updates, so every `Apply` is
/// reported as `Modified`.
fn translate(
    namespace: &str,
    event: Result<watcher::Event<VirtualMachine>, watcher::Error>,
) -> Result<WatchItem, ClusterError> {
    let (kind, vm) = match event? {
        watcher::Event::Init => return Ok(WatchItem::Restarted),
        watcher::Event::InitDone => return Ok(WatchItem::Synced),
        watcher::Event::InitApply(vm) => {
            let id = object_id(namespace, &vm)?;
            return Ok(WatchItem::Listed {
                id,
                observed: manifest::observe(&vm),
            });
        }
        watcher::Event::Apply(vm) => (WatchEventKind::Modified, vm),
        watcher::Event::Delete(vm) => (WatchEventKind::Deleted, vm),
    };

    Ok(WatchItem::Event {
        kind,
        id: object_id(namespace, &vm)?,
        observed: manifest::observe(&vm),
    })
}

fn object_id(namespace: &str, vm: &VirtualMachine) -> Result<ResourceId, ClusterError> {
    resource_id(namespace, vm)
        .ok_or_else(|| ClusterError::Serialization("watch event without object name".to_string()))
}
