//! Cluster watchers and the event pump.
//!
//! One `NamespaceWatcher` per watched namespace publishes into a single
//! bounded channel. A single pump drains it into the reconciler in arrival
//! order, so events for one VM are handled in the order the cluster sent them.
//! A resync marker reaches the pump only after every object of that list, so
//! records it reports missing really were absent from the list.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use kubevirt_client::{ClusterClientTrait, NamespaceWatcher, WatchSettings, WatchUpdate};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered events between the watchers and the pump
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Start one watch loop per namespace, all feeding the returned receiver
pub fn spawn_watchers(
    cluster: &Arc<dyn ClusterClientTrait>,
    namespaces: &[String],
    settings: WatchSettings,
) -> (Vec<JoinHandle<()>>, mpsc::Receiver<WatchUpdate>) {
    let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let handles = namespaces
        .iter()
        .map(|namespace| {
            info!(namespace = %namespace, "Starting VM watcher");
            NamespaceWatcher::new(Arc::clone(cluster), namespace.clone(), sender.clone(), settings).spawn()
        })
        .collect();
    (handles, receiver)
}

/// Feeds watch events to the reconciler
#[derive(Debug)]
pub struct EventPump {
    reconciler: Arc<Reconciler>,
    receiver: mpsc::Receiver<WatchUpdate>,
}

impl EventPump {
    pub fn new(reconciler: Arc<Reconciler>, receiver: mpsc::Receiver<WatchUpdate>) -> Self {
        Self { reconciler, receiver }
    }

    pub fn spawn(self) -> JoinHandle<Result<(), ControllerError>> {
        tokio::spawn(self.run())
    }

    /// Runs until every watcher has stopped
    pub async fn run(mut self) -> Result<(), ControllerError> {
        while let Some(update) = self.receiver.recv().await {
            match update {
                WatchUpdate::Event(event) => {
                    debug!(
                        resource = %event.id,
                        kind = %event.kind,
                        event = %event.event_id,
                        synthetic = event.synthetic,
                        "Handling watch event"
                    );
                    self.reconciler.handle_event(event).await;
                }
                WatchUpdate::Resynced { namespace, listed } => {
                    let deleted = self.reconciler.handle_resync(&namespace, &listed).await;
                    if deleted > 0 {
                        info!(namespace = %namespace, deleted, "Resync removed VMs missing from the cluster");
                    }
                }
            }
        }
        warn!("All watchers stopped, event pump exiting");
        Err(ControllerError::Watch("watch channel closed".to_string()))
    }
}
