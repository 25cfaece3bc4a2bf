//! HostNetwork trait for mocking
//!
//! This trait abstracts netlink link management so the bridge coordinator can
//! be tested without CAP_NET_ADMIN.

use crate::error::HostNetworkError;

/// Trait for host link operations
///
/// Links are addressed by kernel interface index after lookup by name.
#[async_trait::async_trait]
pub trait HostNetworkTrait: Send + Sync {
    /// Look up a link index by interface name; `None` if no such link
    async fn link_index(&self, name: &str) -> Result<Option<u32>, HostNetworkError>;

    /// Enslave `link` to the bridge `bridge`
    async fn attach(&self, link: u32, bridge: u32) -> Result<(), HostNetworkError>;

    /// Release `link` from whatever bridge it is enslaved to
    async fn detach(&self, link: u32) -> Result<(), HostNetworkError>;

    /// Set the link administratively up
    async fn set_up(&self, link: u32) -> Result<(), HostNetworkError>;
}
