//! Host network control
//!
//! Attaches VM interfaces to a Linux bridge on the host over rtnetlink.
//! The concrete [`NetlinkHostNetwork`] needs `CAP_NET_ADMIN`; tests use
//! [`MockHostNetwork`] from the `test-util` feature.

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod host_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::NetlinkHostNetwork;
pub use error::HostNetworkError;
pub use host_trait::HostNetworkTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockHostNetwork;
