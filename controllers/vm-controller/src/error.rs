//! Controller-specific error types.
//!
//! Every failure a caller of the control plane can observe is one of these.
//! Cluster and host errors are folded in through `From` so reconciler code can
//! use `?` on adapter calls.

use hostnet_client::HostNetworkError;
use kubevirt_client::ClusterError;
use thiserror::Error;

/// Errors that can occur in the VM controller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Token missing, malformed, badly signed, expired or revoked
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated identity may not perform the action
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Cluster could not be reached after retries
    #[error("Cluster unreachable: {0}")]
    Unreachable(String),

    /// Resource already exists with a different spec
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Resource is not known to the controller or the cluster
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bridge, host link or bridge capacity not available
    #[error("Interface unavailable: {0}")]
    InterfaceUnavailable(String),

    /// Drift could not be repaired within the attempt budget
    #[error("Reconciliation exhausted: {0}")]
    ReconciliationExhausted(String),

    /// Request rejected before reaching the cluster
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Host network error
    #[error("Host network error: {0}")]
    HostNetwork(#[from] HostNetworkError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ClusterError> for ControllerError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Unreachable(msg) => ControllerError::Unreachable(msg),
            ClusterError::Conflict(msg) => ControllerError::Conflict(msg),
            ClusterError::NotFound(msg) => ControllerError::NotFound(msg),
            // The controller's own service account was rejected; callers did nothing wrong
            ClusterError::Unauthorized(msg) => {
                ControllerError::Internal(format!("cluster rejected controller credentials: {msg}"))
            }
            ClusterError::Expired(msg) => ControllerError::Watch(msg),
            ClusterError::InvalidConfig(msg) => ControllerError::InvalidConfig(msg),
            ClusterError::Api(msg) | ClusterError::Serialization(msg) => ControllerError::Internal(msg),
        }
    }
}

impl From<tokio::task::JoinError> for ControllerError {
    fn from(err: tokio::task::JoinError) -> Self {
        ControllerError::Internal(format!("task failed: {err}"))
    }
}
