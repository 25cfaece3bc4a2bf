//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the KubeVirt API
///
/// Only `Unreachable` is considered transient; the client retries it
/// internally and surfaces it once the retry budget is spent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// API server could not be reached, timed out, or answered 5xx/429
    #[error("Cluster unreachable: {0}")]
    Unreachable(String),

    /// Object exists with a different spec, or optimistic concurrency failed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bearer token rejected (401/403)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Resource version is too old to resume a watch from (410 Gone)
    #[error("Resource version expired: {0}")]
    Expired(String),

    /// Any other API error
    #[error("KubeVirt API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Client could not be constructed from the given settings
    #[error("Invalid cluster configuration: {0}")]
    InvalidConfig(String),
}

impl ClusterError {
    /// Whether the operation may succeed if simply tried again
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unreachable(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => match resp.code {
                404 => ClusterError::NotFound(resp.message.clone()),
                409 => ClusterError::Conflict(resp.message.clone()),
                410 => ClusterError::Expired(resp.message.clone()),
                401 | 403 => ClusterError::Unauthorized(resp.message.clone()),
                429 | 500..=599 => ClusterError::Unreachable(resp.message.clone()),
                _ => ClusterError::Api(err.to_string()),
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_) => {
                ClusterError::Unreachable(err.to_string())
            }
            kube::Error::SerdeError(_) => ClusterError::Serialization(err.to_string()),
            _ => ClusterError::Api(err.to_string()),
        }
    }
}

impl From<kube::runtime::watcher::Error> for ClusterError {
    fn from(err: kube::runtime::watcher::Error) -> Self {
        use kube::runtime::watcher::Error as WatcherError;
        match err {
            WatcherError::InitialListFailed(e)
            | WatcherError::WatchStartFailed(e)
            | WatcherError::WatchFailed(e) => ClusterError::from(e),
            WatcherError::WatchError(resp) => ClusterError::from(kube::Error::Api(resp)),
            WatcherError::NoResourceVersion => {
                ClusterError::Api("watch result without a resource version".to_string())
            }
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}
