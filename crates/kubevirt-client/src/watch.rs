//! Namespace watch loop
//!
//! One [`NamespaceWatcher`] per namespace drains the client's long-lived
//! [`ClusterClientTrait::watch`] stream for as long as the consumer holds the
//! receiving end of its channel:
//!
//! 1. Each framed list becomes one synthetic `Added` event per listed object,
//!    followed by [`WatchUpdate::Resynced`] naming everything that was listed.
//! 2. Live changes are forwarded as they arrive.
//! 3. Failures are logged; the stream itself backs off, resumes, or relists.
//! 4. If the stream ever ends it is reopened after a backoff.
//!
//! Updates for a namespace are sent in the order the cluster produced them,
//! into a single channel, so per-resource ordering is preserved end to end.

use crate::backoff::ExponentialBackoff;
use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::models::{ResourceId, WatchEvent, WatchItem, WatchUpdate};
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnect backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Restartable watch over one namespace
#[derive(Debug)]
pub struct NamespaceWatcher<C: ClusterClientTrait + ?Sized> {
    client: Arc<C>,
    namespace: String,
    sender: mpsc::Sender<WatchUpdate>,
    settings: WatchSettings,
    backoff: ExponentialBackoff,
    /// Objects seen since the current list began
    listed: BTreeSet<ResourceId>,
}

impl<C: ClusterClientTrait + ?Sized + 'static> NamespaceWatcher<C> {
    pub fn new(
        client: Arc<C>,
        namespace: impl Into<String>,
        sender: mpsc::Sender<WatchUpdate>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            sender,
            settings,
            backoff: ExponentialBackoff::new(settings.backoff_min, settings.backoff_max),
            listed: BTreeSet::new(),
        }
    }

    /// Run the loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the consumer drops the channel
    pub async fn run(mut self) {
        info!(namespace = %self.namespace, "Starting namespace watch");
        let mut stream = self.client.watch(&self.namespace, self.settings);
        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                () = self.sender.closed() => break,
            };

            let Some(item) = item else {
                let delay = self.backoff.next_backoff();
                warn!(
                    namespace = %self.namespace,
                    attempt = self.backoff.attempts(),
                    delay_ms = delay.as_millis(),
                    "Watch stream ended, reopening"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.sender.closed() => break,
                }
                stream = self.client.watch(&self.namespace, self.settings);
                continue;
            };

            let Some(update) = self.translate(item) else {
                continue;
            };
            self.backoff.reset();
            if self.sender.send(update).await.is_err() {
                break;
            }
        }
        info!(namespace = %self.namespace, "Namespace watch stopped, consumer gone");
    }

    fn translate(&mut self, item: Result<WatchItem, ClusterError>) -> Option<WatchUpdate> {
        match item {
            Ok(WatchItem::Restarted) => {
                info!(namespace = %self.namespace, "Resynchronizing namespace");
                self.listed.clear();
                None
            }
            Ok(WatchItem::Listed { id, observed }) => {
                self.listed.insert(id.clone());
                Some(WatchUpdate::Event(WatchEvent::synthetic(id, observed)))
            }
            Ok(WatchItem::Synced) => {
                let listed = std::mem::take(&mut self.listed);
                info!(namespace = %self.namespace, objects = listed.len(), "Namespace resynchronized");
                Some(WatchUpdate::Resynced {
                    namespace: self.namespace.clone(),
                    listed,
                })
            }
            Ok(WatchItem::Event { kind, id, observed }) => {
                debug!(namespace = %self.namespace, resource = %id, %kind, version = ?observed.resource_version, "Watch event");
                Some(WatchUpdate::Event(WatchEvent::new(kind, id, observed)))
            }
            Err(ClusterError::Expired(msg)) => {
                info!(namespace = %self.namespace, reason = %msg, "Watch resource version expired, relisting");
                None
            }
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "Watch failed, backing off");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockClusterClient, MockOperation};
    use crate::models::{ResourceSpec, WatchEventKind};
    use tokio::time::timeout;

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

    fn fast() -> WatchSettings {
        WatchSettings {
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<WatchUpdate>) -> WatchUpdate {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for watch update")
            .expect("watch channel closed")
    }

    async fn recv_event(rx: &mut mpsc::Receiver<WatchUpdate>) -> WatchEvent {
        match recv(rx).await {
            WatchUpdate::Event(event) => event,
            other => panic!("expected an event, got {:?}", other),
        }
    }

    async fn recv_resynced(rx: &mut mpsc::Receiver<WatchUpdate>) -> BTreeSet<ResourceId> {
        match recv(rx).await {
            WatchUpdate::Resynced { namespace, listed } => {
                assert_eq!(namespace, "vms");
                listed
            }
            other => panic!("expected a resync marker, got {:?}", other),
        }
    }

    async fn wait_for_watchers(mock: &MockClusterClient, count: usize) {
        timeout(Duration::from_secs(5), async {
            while mock.open_watchers() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("watch never connected");
    }

    #[tokio::test]
    async fn test_initial_list_emits_synthetic_added_then_marker() {
        let mock = MockClusterClient::new();
        mock.insert(&spec("a"), "alice");
        mock.insert(&spec("b"), "alice");

        let (tx, mut rx) = mpsc::channel(16);
        let handle = NamespaceWatcher::new(Arc::new(mock.clone()), "vms", tx, fast()).spawn();

        let first = recv_event(&mut rx).await;
        let second = recv_event(&mut rx).await;
        assert!(first.synthetic && second.synthetic);
        assert_eq!(first.kind, WatchEventKind::Added);
        assert_eq!(first.id, ResourceId::new("vms", "a"));
        assert_eq!(second.id, ResourceId::new("vms", "b"));
        assert_eq!(
            recv_resynced(&mut rx).await,
            BTreeSet::from([ResourceId::new("vms", "a"), ResourceId::new("vms", "b")])
        );

        drop(rx);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_live_events_follow_in_order() {
        let mock = MockClusterClient::new();
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = NamespaceWatcher::new(Arc::new(mock.clone()), "vms", tx, fast()).spawn();
        assert!(recv_resynced(&mut rx).await.is_empty());
        wait_for_watchers(&mock, 1).await;

        let id = ResourceId::new("vms", "a");
        mock.insert(&spec("a"), "alice");
        mock.set_ready(&id);
        mock.remove_externally(&id);

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let event = recv_event(&mut rx).await;
            kinds.push((event.kind, event.synthetic));
        }
        assert_eq!(
            kinds,
            vec![
                (WatchEventKind::Added, false),
                (WatchEventKind::Modified, false),
                (WatchEventKind::Deleted, false),
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_resumes_without_relist() {
        let mock = MockClusterClient::new();
        mock.insert(&spec("a"), "alice");
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = NamespaceWatcher::new(Arc::new(mock.clone()), "vms", tx, fast()).spawn();

        assert!(recv_event(&mut rx).await.synthetic);
        recv_resynced(&mut rx).await;
        wait_for_watchers(&mock, 1).await;

        mock.disconnect_watchers();
        // Happens while disconnected; replayed from history on resume
        mock.set_ready(&ResourceId::new("vms", "a"));

        let event = recv_event(&mut rx).await;
        assert_eq!(event.kind, WatchEventKind::Modified);
        assert!(!event.synthetic);
        assert_eq!(mock.calls(MockOperation::List), 1);
    }

    #[tokio::test]
    async fn test_expired_version_relists_and_reports_missing() {
        let mock = MockClusterClient::new();
        mock.insert(&spec("a"), "alice");
        mock.insert(&spec("gone"), "alice");
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = NamespaceWatcher::new(Arc::new(mock.clone()), "vms", tx, fast()).spawn();

        recv_event(&mut rx).await;
        recv_event(&mut rx).await;
        recv_resynced(&mut rx).await;
        wait_for_watchers(&mock, 1).await;

        mock.disconnect_watchers();
        mock.insert(&spec("b"), "alice");
        mock.remove_externally(&ResourceId::new("vms", "gone"));
        mock.compact();

        // Live objects come back as synthetic Added events; the deletion is
        // only visible as an absence from the marker
        let first = recv_event(&mut rx).await;
        let second = recv_event(&mut rx).await;
        assert!(first.synthetic && second.synthetic);
        assert_eq!(first.id.name, "a");
        assert_eq!(second.id.name, "b");
        assert_eq!(
            recv_resynced(&mut rx).await,
            BTreeSet::from([ResourceId::new("vms", "a"), ResourceId::new("vms", "b")])
        );
        assert_eq!(mock.calls(MockOperation::List), 2);
    }

    #[tokio::test]
    async fn test_failed_list_is_retried_with_backoff() {
        let mock = MockClusterClient::new();
        mock.insert(&spec("a"), "alice");
        mock.fail_next(MockOperation::List, ClusterError::Unreachable("down".into()));

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = NamespaceWatcher::new(Arc::new(mock.clone()), "vms", tx, fast()).spawn();

        let event = recv_event(&mut rx).await;
        assert!(event.synthetic);
        assert_eq!(mock.calls(MockOperation::List), 2);
    }
}
