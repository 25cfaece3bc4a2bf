//! Mock ClusterClient for unit testing
//!
//! An in-memory cluster with monotonically increasing resource versions.
//! Mutations of managed objects are broadcast to open subscriptions and kept
//! in a history so a watch can resume from any version that has not been
//! compacted away. [`ClusterClientTrait::watch`] drives those subscriptions
//! the way `kube::runtime::watcher` drives the API server: a framed list,
//! then live events, resume after a disconnect, relist once the version has
//! expired. Failures can be injected per operation to exercise error paths.

use crate::backoff::ExponentialBackoff;
use crate::cluster_trait::{ClusterClientTrait, WatchStream};
use crate::error::ClusterError;
use crate::manifest;
use crate::models::*;
use crate::watch::WatchSettings;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Operations that can be counted or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Apply,
    Replace,
    Restart,
    Delete,
    Get,
    List,
    NetworkIdentity,
    /// Opening (or resuming) a subscription
    Watch,
    CreateSnapshot,
    ListSnapshots,
    GetSnapshot,
    DeleteSnapshot,
}

type WatchSender = mpsc::UnboundedSender<Result<WatchItem, ClusterError>>;
type SubscriptionSender = mpsc::UnboundedSender<WatchItem>;

#[derive(Debug, Default)]
struct MockState {
    objects: BTreeMap<ResourceId, ObservedState>,
    identities: HashMap<ResourceId, NetworkIdentity>,
    version: u64,
    /// Versions below this can no longer be resumed from
    compacted_before: u64,
    history: Vec<(u64, String, WatchItem)>,
    watchers: Vec<(String, SubscriptionSender)>,
    snapshots: BTreeMap<(String, String), SnapshotInfo>,
    failures: HashMap<MockOperation, VecDeque<ClusterError>>,
    calls: HashMap<MockOperation, u32>,
    latency: Option<Duration>,
}

impl MockState {
    fn record(&mut self, op: MockOperation) -> Result<(), ClusterError> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// Publish a change; objects without the managed-by label are never watched
    fn emit(&mut self, kind: WatchEventKind, id: &ResourceId, observed: ObservedState) {
        if !observed.managed {
            return;
        }
        let item = WatchItem::Event {
            kind,
            id: id.clone(),
            observed,
        };
        self.history
            .push((self.version, id.namespace.clone(), item.clone()));
        self.watchers.retain(|(namespace, sender)| {
            if namespace != &id.namespace {
                return !sender.is_closed();
            }
            sender.send(item.clone()).is_ok()
        });
    }

    /// Apply `change` to an object, bump its version and publish `Modified`
    fn modify(&mut self, id: &ResourceId, change: impl FnOnce(&mut ObservedState)) -> bool {
        let version = self.version + 1;
        let Some(observed) = self.objects.get_mut(id) else {
            return false;
        };
        change(&mut *observed);
        observed.resource_version = Some(version.to_string());
        let observed = observed.clone();
        self.version = version;
        self.emit(WatchEventKind::Modified, id, observed);
        true
    }
}

fn initial_observed(spec: &ResourceSpec, owner: &str) -> ObservedState {
    ObservedState {
        fingerprint: Some(spec.fingerprint()),
        phase: ClusterPhase::Provisioning,
        printable_status: "Provisioning".to_string(),
        resource_version: None,
        spec_hash: Some(spec.spec_hash()),
        owner: Some(owner.to_string()),
        uid: Some(uuid::Uuid::new_v4().to_string()),
        managed: true,
    }
}

fn printable_for(phase: ClusterPhase) -> &'static str {
    match phase {
        ClusterPhase::Provisioning => "Provisioning",
        ClusterPhase::Ready | ClusterPhase::NotReady => "Running",
        ClusterPhase::Stopped => "Stopped",
        ClusterPhase::Failed => "CrashLoopBackOff",
    }
}

/// Mock ClusterClient for testing
///
/// Cloning shares the underlying cluster.
#[derive(Debug, Clone, Default)]
pub struct MockClusterClient {
    state: Arc<Mutex<MockState>>,
}

impl MockClusterClient {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `error` (queued, one per call)
    pub fn fail_next(&self, op: MockOperation, error: ClusterError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Delay every mutating call by `latency` before it takes effect
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    /// Number of times `op` was invoked (including injected failures)
    pub fn calls(&self, op: MockOperation) -> u32 {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.state.lock().unwrap().objects.contains_key(id)
    }

    pub fn observed(&self, id: &ResourceId) -> Option<ObservedState> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(id)
            .cloned()
    }

    /// Current collection resource version
    pub fn resource_version(&self) -> String {
        self.state.lock().unwrap().version.to_string()
    }

    /// Seed a managed object, as if an earlier controller run had created it
    pub fn insert(&self, spec: &ResourceSpec, owner: &str) {
        self.seed(initial_observed(spec, owner), &spec.id());
    }

    /// Seed an object without the managed-by label or an owner
    pub fn insert_unmanaged(&self, spec: &ResourceSpec) {
        let mut observed = initial_observed(spec, "");
        observed.owner = None;
        observed.managed = false;
        self.seed(observed, &spec.id());
    }

    fn seed(&self, mut observed: ObservedState, id: &ResourceId) {
        let mut state = self.state.lock().unwrap();
        observed.resource_version = Some(state.bump());
        state.objects.insert(id.clone(), observed.clone());
        state.emit(WatchEventKind::Added, id, observed);
    }

    /// Move an object to `phase`, publishing `Modified`
    pub fn set_phase(&self, id: &ResourceId, phase: ClusterPhase) -> bool {
        self.state.lock().unwrap().modify(id, |observed| {
            observed.phase = phase;
            observed.printable_status = printable_for(phase).to_string();
        })
    }

    /// Shorthand for `set_phase(id, Ready)`
    pub fn set_ready(&self, id: &ResourceId) -> bool {
        self.set_phase(id, ClusterPhase::Ready)
    }

    /// Publish a network identity for the instance behind `id`
    pub fn set_network_identity(&self, id: &ResourceId, identity: NetworkIdentity) {
        self.state
            .lock()
            .unwrap()
            .identities
            .insert(id.clone(), identity);
    }

    /// Change the observed spec out from under the controller
    pub fn drift(&self, id: &ResourceId, fingerprint: SpecFingerprint) -> bool {
        self.state.lock().unwrap().modify(id, |observed| {
            observed.spec_hash = Some(fingerprint.hash());
            observed.fingerprint = Some(fingerprint);
        })
    }

    /// Remove an object without going through the client
    pub fn remove_externally(&self, id: &ResourceId) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(mut observed) = state.objects.remove(id) else {
            return false;
        };
        state.identities.remove(id);
        observed.resource_version = Some(state.bump());
        state.emit(WatchEventKind::Deleted, id, observed);
        true
    }

    /// Drop every open watch stream
    pub fn disconnect_watchers(&self) {
        self.state.lock().unwrap().watchers.clear();
    }

    /// Forget watch history so older versions answer `Expired`
    pub fn compact(&self) {
        let mut state = self.state.lock().unwrap();
        state.compacted_before = state.version + 1;
        state.history.clear();
    }

    /// Number of snapshots stored in `namespace`
    pub fn snapshot_count(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    /// Number of watch subscriptions currently open
    pub fn open_watchers(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.watchers.retain(|(_, sender)| !sender.is_closed());
        state.watchers.len()
    }

    /// Build the watch event the cluster would send for `id` right now
    pub fn event(&self, id: &ResourceId, kind: WatchEventKind) -> Option<WatchEvent> {
        self.observed(id)
            .map(|observed| WatchEvent::new(kind, id.clone(), observed))
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Subscribe to changes after `resource_version`, replaying history
    fn subscribe(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<mpsc::UnboundedReceiver<WatchItem>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::Watch)?;

        let from: u64 = resource_version
            .parse()
            .map_err(|_| ClusterError::Api(format!("invalid resource version '{resource_version}'")))?;
        if from < state.compacted_before.saturating_sub(1) {
            return Err(ClusterError::Expired(format!(
                "resource version {from} is older than {}",
                state.compacted_before
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (version, ns, item) in &state.history {
            if *version > from && ns == namespace {
                let _ = tx.send(item.clone());
            }
        }
        state.watchers.push((namespace.to_string(), tx));
        Ok(rx)
    }

    /// Send a framed list of the managed objects; returns the list version
    fn relist(&self, namespace: &str, out: &WatchSender) -> Result<String, ClusterError> {
        let (version, items) = {
            let mut state = self.state.lock().unwrap();
            state.record(MockOperation::List)?;
            let items: Vec<_> = state
                .objects
                .iter()
                .filter(|(id, observed)| id.namespace == namespace && observed.managed)
                .map(|(id, observed)| (id.clone(), observed.clone()))
                .collect();
            (state.version.to_string(), items)
        };

        let _ = out.send(Ok(WatchItem::Restarted));
        for (id, observed) in items {
            let _ = out.send(Ok(WatchItem::Listed { id, observed }));
        }
        let _ = out.send(Ok(WatchItem::Synced));
        Ok(version)
    }

    /// Forward one subscription; returns the last version seen when it ends
    async fn follow(
        &self,
        namespace: &str,
        from: &str,
        out: &WatchSender,
        backoff: &mut ExponentialBackoff,
    ) -> Result<String, ClusterError> {
        let mut subscription = self.subscribe(namespace, from)?;
        let mut last = from.to_string();
        loop {
            let item = tokio::select! {
                item = subscription.recv() => item,
                () = out.closed() => return Ok(last),
            };
            let Some(item) = item else {
                return Ok(last);
            };
            if let WatchItem::Event { observed, .. } = &item {
                if let Some(version) = &observed.resource_version {
                    last.clone_from(version);
                }
            }
            if out.send(Ok(item)).is_err() {
                return Ok(last);
            }
            backoff.reset();
        }
    }

    async fn drive_watch(self, namespace: String, settings: WatchSettings, out: WatchSender) {
        let mut backoff = ExponentialBackoff::new(settings.backoff_min, settings.backoff_max);
        let mut version: Option<String> = None;
        loop {
            let failure = match version.clone() {
                None => match self.relist(&namespace, &out) {
                    Ok(listed_at) => {
                        version = Some(listed_at);
                        backoff.reset();
                        continue;
                    }
                    Err(e) => Some(e),
                },
                Some(from) => match self.follow(&namespace, &from, &out, &mut backoff).await {
                    Ok(last) => {
                        version = Some(last);
                        None
                    }
                    Err(ClusterError::Expired(msg)) => {
                        version = None;
                        if out.send(Err(ClusterError::Expired(msg))).is_err() {
                            return;
                        }
                        continue;
                    }
                    Err(e) => Some(e),
                },
            };
            if let Some(e) = failure {
                if out.send(Err(e)).is_err() {
                    return;
                }
            }

            tokio::select! {
                () = tokio::time::sleep(backoff.next_backoff()) => {}
                () = out.closed() => return,
            }
        }
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn validate_token(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn apply(&self, spec: &ResourceSpec, owner: &str) -> Result<ResourceHandle, ClusterError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::Apply)?;

        let id = spec.id();
        if let Some(existing) = state.objects.get(&id) {
            if existing.spec_hash.as_deref() == Some(spec.spec_hash().as_str()) {
                return Ok(ResourceHandle {
                    id,
                    uid: existing.uid.clone(),
                    resource_version: existing.resource_version.clone(),
                    created: false,
                });
            }
            return Err(ClusterError::Conflict(format!(
                "{id} already exists with a different spec"
            )));
        }

        let mut observed = initial_observed(spec, owner);
        observed.resource_version = Some(state.bump());
        state.objects.insert(id.clone(), observed.clone());
        state.emit(WatchEventKind::Added, &id, observed.clone());

        Ok(ResourceHandle {
            id,
            uid: observed.uid,
            resource_version: observed.resource_version,
            created: true,
        })
    }

    async fn replace(&self, spec: &ResourceSpec, owner: &str) -> Result<ResourceHandle, ClusterError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::Replace)?;

        let id = spec.id();
        if !state.objects.contains_key(&id) {
            return Err(ClusterError::NotFound(id.to_string()));
        }
        let fingerprint = spec.fingerprint();
        let hash = spec.spec_hash();
        state.modify(&id, |observed| {
            observed.fingerprint = Some(fingerprint);
            observed.spec_hash = Some(hash);
            observed.owner = Some(owner.to_string());
        });

        let observed = &state.objects[&id];
        Ok(ResourceHandle {
            id: id.clone(),
            uid: observed.uid.clone(),
            resource_version: observed.resource_version.clone(),
            created: false,
        })
    }

    async fn restart(&self, id: &ResourceId) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::Restart)?;
        if !state.objects.contains_key(id) {
            return Err(ClusterError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        self.simulate_latency().await;
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::Delete)?;

        let Some(mut observed) = state.objects.remove(id) else {
            return Err(ClusterError::NotFound(id.to_string()));
        };
        state.identities.remove(id);
        observed.resource_version = Some(state.bump());
        state.emit(WatchEventKind::Deleted, id, observed);
        Ok(())
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<ObservedState>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::Get)?;
        Ok(state.objects.get(id).cloned())
    }

    async fn list(&self, namespace: &str) -> Result<ListSnapshot, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::List)?;
        let items = state
            .objects
            .iter()
            .filter(|(id, observed)| id.namespace == namespace && observed.managed)
            .map(|(id, observed)| (id.clone(), observed.clone()))
            .collect();
        Ok(ListSnapshot {
            resource_version: state.version.to_string(),
            items,
        })
    }

    async fn network_identity(&self, id: &ResourceId) -> Result<Option<NetworkIdentity>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::NetworkIdentity)?;
        Ok(state.identities.get(id).cloned())
    }

    fn watch(&self, namespace: &str, settings: WatchSettings) -> WatchStream {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().drive_watch(namespace.to_string(), settings, tx));
        UnboundedReceiverStream::new(rx).boxed()
    }

    async fn create_snapshot(&self, vm: &ResourceId) -> Result<SnapshotInfo, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::CreateSnapshot)?;
        if !state.objects.contains_key(vm) {
            return Err(ClusterError::NotFound(vm.to_string()));
        }

        let info = SnapshotInfo {
            name: manifest::snapshot_name(&vm.name),
            namespace: vm.namespace.clone(),
            source: vm.name.clone(),
            phase: Some("Succeeded".to_string()),
            ready_to_use: true,
            created_at: Some(Utc::now()),
            error: None,
        };
        state
            .snapshots
            .insert((info.namespace.clone(), info.name.clone()), info.clone());
        Ok(info)
    }

    async fn list_snapshots(&self, vm: &ResourceId) -> Result<Vec<SnapshotInfo>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::ListSnapshots)?;
        let mut snapshots: Vec<SnapshotInfo> = state
            .snapshots
            .values()
            .filter(|s| s.namespace == vm.namespace && s.source == vm.name)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
        Ok(snapshots)
    }

    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<Option<SnapshotInfo>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::GetSnapshot)?;
        Ok(state
            .snapshots
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        state.record(MockOperation::DeleteSnapshot)?;
        state
            .snapshots
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("{namespace}/{name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ResourceSpec {
        ResourceSpec {
            name: name.to_string(),
            namespace: "vms".to_string(),
            image: "https://images.example.com/ubuntu.img".to_string(),
            cpu_cores: 1,
            memory_gib: 2,
            disk_gib: 10,
            credentials: None,
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let mock = MockClusterClient::new();
        let first = mock.apply(&spec("a"), "alice").await.unwrap();
        let second = mock.apply(&spec("a"), "alice").await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.uid, second.uid);
        assert_eq!(mock.object_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_different_spec_conflicts() {
        let mock = MockClusterClient::new();
        mock.apply(&spec("a"), "alice").await.unwrap();
        let mut bigger = spec("a");
        bigger.cpu_cores = 4;
        assert!(matches!(
            mock.apply(&bigger, "alice").await,
            Err(ClusterError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let mock = MockClusterClient::new();
        mock.fail_next(MockOperation::Apply, ClusterError::Unreachable("down".into()));

        assert!(mock.apply(&spec("a"), "alice").await.is_err());
        assert!(mock.apply(&spec("a"), "alice").await.is_ok());
        assert_eq!(mock.calls(MockOperation::Apply), 2);
    }

    fn fast() -> WatchSettings {
        WatchSettings {
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        }
    }

    async fn next(stream: &mut WatchStream) -> Result<WatchItem, ClusterError> {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for watch item")
            .expect("watch stream ended")
    }

    fn listed_name(item: Result<WatchItem, ClusterError>) -> String {
        match item {
            Ok(WatchItem::Listed { id, .. }) => id.name,
            other => panic!("expected a listed object, got {:?}", other),
        }
    }

    async fn wait_for_subscription(mock: &MockClusterClient) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while mock.open_watchers() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("watch never subscribed");
    }

    #[tokio::test]
    async fn test_watch_frames_initial_list_then_follows() {
        let mock = MockClusterClient::new();
        mock.apply(&spec("a"), "alice").await.unwrap();
        mock.insert_unmanaged(&spec("stray"));
        mock.apply(&spec("b"), "alice").await.unwrap();

        let mut stream = mock.watch("vms", fast());
        assert_eq!(next(&mut stream).await, Ok(WatchItem::Restarted));
        assert_eq!(listed_name(next(&mut stream).await), "a");
        assert_eq!(listed_name(next(&mut stream).await), "b");
        assert_eq!(next(&mut stream).await, Ok(WatchItem::Synced));

        wait_for_subscription(&mock).await;
        mock.insert_unmanaged(&spec("stray-2"));
        mock.apply(&spec("c"), "alice").await.unwrap();
        match next(&mut stream).await {
            Ok(WatchItem::Event { kind, id, .. }) => {
                assert_eq!(kind, WatchEventKind::Added);
                assert_eq!(id.name, "c");
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watch_resumes_from_history_after_disconnect() {
        let mock = MockClusterClient::new();
        mock.apply(&spec("a"), "alice").await.unwrap();
        let mut stream = mock.watch("vms", fast());
        for _ in 0..3 {
            next(&mut stream).await.unwrap();
        }
        wait_for_subscription(&mock).await;

        mock.disconnect_watchers();
        mock.apply(&spec("b"), "alice").await.unwrap();

        match next(&mut stream).await {
            Ok(WatchItem::Event { id, .. }) => assert_eq!(id.name, "b"),
            other => panic!("unexpected item {:?}", other),
        }
        assert_eq!(mock.calls(MockOperation::List), 1);
    }

    #[tokio::test]
    async fn test_watch_after_compaction_relists() {
        let mock = MockClusterClient::new();
        mock.apply(&spec("a"), "alice").await.unwrap();
        let mut stream = mock.watch("vms", fast());
        for _ in 0..3 {
            next(&mut stream).await.unwrap();
        }
        wait_for_subscription(&mock).await;

        mock.disconnect_watchers();
        mock.apply(&spec("b"), "alice").await.unwrap();
        mock.compact();

        assert!(matches!(next(&mut stream).await, Err(ClusterError::Expired(_))));
        assert_eq!(next(&mut stream).await, Ok(WatchItem::Restarted));
        assert_eq!(listed_name(next(&mut stream).await), "a");
        assert_eq!(listed_name(next(&mut stream).await), "b");
        assert_eq!(next(&mut stream).await, Ok(WatchItem::Synced));
        assert_eq!(mock.calls(MockOperation::List), 2);
    }

    #[tokio::test]
    async fn test_failed_list_is_yielded_and_retried() {
        let mock = MockClusterClient::new();
        mock.fail_next(MockOperation::List, ClusterError::Unreachable("down".into()));

        let mut stream = mock.watch("vms", fast());
        assert!(matches!(next(&mut stream).await, Err(ClusterError::Unreachable(_))));
        assert_eq!(next(&mut stream).await, Ok(WatchItem::Restarted));
        assert_eq!(next(&mut stream).await, Ok(WatchItem::Synced));
    }

    #[tokio::test]
    async fn test_snapshots_belong_to_their_vm() {
        let mock = MockClusterClient::new();
        mock.apply(&spec("a"), "alice").await.unwrap();
        mock.apply(&spec("b"), "alice").await.unwrap();
        let a = ResourceId::new("vms", "a");

        let first = mock.create_snapshot(&a).await.unwrap();
        mock.create_snapshot(&ResourceId::new("vms", "b")).await.unwrap();
        assert!(first.name.starts_with("a-snap-"));
        assert_eq!(mock.list_snapshots(&a).await.unwrap(), vec![first.clone()]);
        assert_eq!(mock.get_snapshot("vms", &first.name).await.unwrap(), Some(first.clone()));

        mock.delete_snapshot("vms", &first.name).await.unwrap();
        assert!(matches!(
            mock.delete_snapshot("vms", &first.name).await,
            Err(ClusterError::NotFound(_))
        ));
        assert_eq!(mock.snapshot_count("vms"), 1);
        assert!(matches!(
            mock.create_snapshot(&ResourceId::new("vms", "ghost")).await,
            Err(ClusterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let mock = MockClusterClient::new();
        assert!(matches!(
            mock.delete(&ResourceId::new("vms", "ghost")).await,
            Err(ClusterError::NotFound(_))
        ));
    }
}
