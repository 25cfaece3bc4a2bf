//! Host network errors

use thiserror::Error;

/// Errors that can occur when changing host links
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostNetworkError {
    /// Netlink socket could not be opened
    #[error("Netlink connection failed: {0}")]
    Connection(String),

    /// Link does not exist (ENODEV)
    #[error("Link not found: {0}")]
    LinkNotFound(String),

    /// Kernel rejected the request
    #[error("Netlink error: {0}")]
    Netlink(String),
}
