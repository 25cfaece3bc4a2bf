//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the cluster
//! client, the host bridge and the reconciler together and runs the
//! background tasks:
//! - one watcher per watched namespace
//! - the event pump feeding the reconciler
//! - a maintenance ticker (deferred detaches, pending networks, token cache,
//!   old `Deleted` records)

use crate::auth::AuthGuard;
use crate::bridge::BridgeCoordinator;
use crate::config::Config;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::service::ControlPlane;
use crate::templates::TemplateCatalog;
use crate::watcher::{spawn_watchers, EventPump};
use hostnet_client::{HostNetworkTrait, NetlinkHostNetwork};
use kubevirt_client::{ClusterClientTrait, KubeVirtClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// How often deferred work is retried
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// How long a `Deleted` record stays visible before it is dropped
const TOMBSTONE_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Main controller for VM lifecycle management.
pub struct Controller {
    config: Arc<Config>,
    cluster: Arc<dyn ClusterClientTrait>,
    bridge: Arc<BridgeCoordinator>,
    reconciler: Arc<Reconciler>,
    control_plane: Arc<ControlPlane>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller against the configured cluster and this host's netlink.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing VM Controller");

        let cluster = KubeVirtClient::new(config.cluster_settings())?;

        // Validate token and connectivity before proceeding
        info!("Validating Kubernetes token and connectivity...");
        cluster.validate_token().await.map_err(|e| {
            error!("Failed to validate Kubernetes token: {}", e);
            error!("Please ensure:");
            error!("  1. KUBERNETES_TOKEN is set to a valid service account token");
            error!("  2. The token may read and write kubevirt.io virtualmachines in {:?}", config.watch_namespaces);
            error!("  3. The API server is reachable at {}", config.api_url);
            ControllerError::from(e)
        })?;
        info!("Kubernetes token validated and connectivity established");

        let host = NetlinkHostNetwork::new()?;
        let templates = match &config.templates_path {
            Some(path) => TemplateCatalog::load(path)?,
            None => TemplateCatalog::empty(),
        };

        let controller = Self::with_clients(config, Arc::new(cluster), Arc::new(host), templates);
        controller.bridge.ensure_uplink().await?;
        Ok(controller)
    }

    /// Creates a controller from already-built clients.
    pub fn with_clients(
        config: Config,
        cluster: Arc<dyn ClusterClientTrait>,
        host: Arc<dyn HostNetworkTrait>,
        templates: TemplateCatalog,
    ) -> Self {
        let config = Arc::new(config);
        let bridge = Arc::new(BridgeCoordinator::new(
            host,
            config.bridge.clone(),
            config.interface.clone(),
            config.bridge_capacity,
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&cluster),
            Arc::clone(&bridge),
            config.max_reconcile_attempts,
        ));
        let auth = Arc::new(AuthGuard::new(&config));
        let control_plane = Arc::new(ControlPlane::new(
            auth,
            Arc::clone(&reconciler),
            templates,
            config.namespace.clone(),
        ));

        Self {
            config,
            cluster,
            bridge,
            reconciler,
            control_plane,
        }
    }

    /// Entry points for the inbound command layer
    pub fn control_plane(&self) -> Arc<ControlPlane> {
        Arc::clone(&self.control_plane)
    }

    /// Runs the controller until shutdown or until a background task exits.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!(namespaces = ?self.config.watch_namespaces, "Starting VM Controller");

        let (watchers, receiver) = spawn_watchers(
            &self.cluster,
            &self.config.watch_namespaces,
            self.config.watch_settings(),
        );
        let pump = EventPump::new(Arc::clone(&self.reconciler), receiver).spawn();
        let maintenance = self.spawn_maintenance();

        let result = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
                Ok(())
            }
            result = pump => {
                error!("Event pump exited");
                result?
            }
        };

        maintenance.abort();
        for watcher in watchers {
            watcher.abort();
        }
        info!("VM Controller stopped");
        result
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let bridge = Arc::clone(&self.bridge);
        let reconciler = Arc::clone(&self.reconciler);
        let control_plane = Arc::clone(&self.control_plane);
        let auth = Arc::clone(self.control_plane.auth());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                let detached = bridge.retry_deferred().await;
                let promoted = reconciler.retry_pending_network().await;
                let purged = auth.cache().purge_expired();
                let evicted = reconciler.evict_tombstones(TOMBSTONE_RETENTION);
                let pruned = control_plane.prune();
                debug!(detached, promoted, purged, evicted, pruned, "Maintenance pass");
            }
        })
    }
}
