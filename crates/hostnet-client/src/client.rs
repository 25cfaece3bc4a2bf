//! Netlink-backed host network control

use crate::error::HostNetworkError;
use crate::host_trait::HostNetworkTrait;
use futures::TryStreamExt;
use rtnetlink::Handle;
use tracing::debug;

/// Host network control over an rtnetlink socket
#[derive(Clone)]
pub struct NetlinkHostNetwork {
    handle: Handle,
}

impl NetlinkHostNetwork {
    /// Open a netlink connection and drive it on a background task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Result<Self, HostNetworkError> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| HostNetworkError::Connection(e.to_string()))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

fn map_error(err: rtnetlink::Error, what: impl Into<String>) -> HostNetworkError {
    match err {
        rtnetlink::Error::NetlinkError(e) if e.raw_code() == -libc::ENODEV => {
            HostNetworkError::LinkNotFound(what.into())
        }
        other => HostNetworkError::Netlink(other.to_string()),
    }
}

#[async_trait::async_trait]
impl HostNetworkTrait for NetlinkHostNetwork {
    async fn link_index(&self, name: &str) -> Result<Option<u32>, HostNetworkError> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            Err(e) => match map_error(e, name) {
                HostNetworkError::LinkNotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn attach(&self, link: u32, bridge: u32) -> Result<(), HostNetworkError> {
        self.handle
            .link()
            .set(link)
            .controller(bridge)
            .execute()
            .await
            .map_err(|e| map_error(e, format!("index {link}")))?;
        debug!(link, bridge, "Link enslaved to bridge");
        Ok(())
    }

    async fn detach(&self, link: u32) -> Result<(), HostNetworkError> {
        self.handle
            .link()
            .set(link)
            .nocontroller()
            .execute()
            .await
            .map_err(|e| map_error(e, format!("index {link}")))?;
        debug!(link, "Link released from bridge");
        Ok(())
    }

    async fn set_up(&self, link: u32) -> Result<(), HostNetworkError> {
        self.handle
            .link()
            .set(link)
            .up()
            .execute()
            .await
            .map_err(|e| map_error(e, format!("index {link}")))
    }
}
