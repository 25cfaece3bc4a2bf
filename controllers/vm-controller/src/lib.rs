//! VM Controller
//!
//! Reconciles KubeVirt virtual machines and binds their interfaces to a
//! Linux bridge on the host:
//! - Auth: bearer-token verification, role checks and a verified-token cache
//! - Reconciler: per-VM lifecycle, drift repair and watch event handling
//! - Bridge: host link attachment with capacity limits and deferred detaches
//! - Service: the typed command surface an HTTP layer calls, including
//!   snapshots and per-VM cost records
//!
//! Cluster state is the source of truth; the controller converges toward it
//! from watch events. On each resync it adopts VMs carrying its managed-by
//! label and owner annotation, and tombstones records the cluster no longer
//! has. Unlabelled VMs are never touched.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod reconciler;
pub mod service;
pub mod templates;
pub mod watcher;
mod test_utils;

pub use config::Config;
pub use controller::Controller;
pub use error::ControllerError;
pub use service::{ControlPlane, CostRecord, CreateVmRequest, ResizeVmRequest, VmView};
