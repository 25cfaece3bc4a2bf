//! Mock HostNetwork for unit testing
//!
//! Keeps links, bridge membership and link state in memory.

use crate::error::HostNetworkError;
use crate::host_trait::HostNetworkTrait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MockHostState {
    links: HashMap<String, u32>,
    controllers: HashMap<u32, u32>,
    up: HashSet<u32>,
    next_index: u32,
    failing_attaches: u32,
    failing_detaches: u32,
}

impl MockHostState {
    fn exists(&self, index: u32) -> bool {
        self.links.values().any(|i| *i == index)
    }
}

/// Mock HostNetwork for testing
///
/// Cloning shares the underlying link table.
#[derive(Debug, Clone, Default)]
pub struct MockHostNetwork {
    state: Arc<Mutex<MockHostState>>,
}

impl MockHostNetwork {
    /// Create a mock host with no links
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a link (for test setup) and return its index
    pub fn add_link(&self, name: &str) -> u32 {
        let mut state = self.state.lock().unwrap();
        if let Some(index) = state.links.get(name) {
            return *index;
        }
        state.next_index += 1;
        let index = state.next_index;
        state.links.insert(name.to_string(), index);
        index
    }

    /// Remove a link as if the device disappeared
    pub fn remove_link(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(index) = state.links.remove(name) {
            state.controllers.remove(&index);
            state.up.remove(&index);
        }
    }

    /// Bridge index the named link is enslaved to
    pub fn controller_of(&self, name: &str) -> Option<u32> {
        let state = self.state.lock().unwrap();
        let index = state.links.get(name)?;
        state.controllers.get(index).copied()
    }

    pub fn is_up(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .links
            .get(name)
            .is_some_and(|index| state.up.contains(index))
    }

    /// Make the next `count` attach calls fail
    pub fn fail_next_attaches(&self, count: u32) {
        self.state.lock().unwrap().failing_attaches = count;
    }

    /// Make the next `count` detach calls fail
    pub fn fail_next_detaches(&self, count: u32) {
        self.state.lock().unwrap().failing_detaches = count;
    }
}

#[async_trait::async_trait]
impl HostNetworkTrait for MockHostNetwork {
    async fn link_index(&self, name: &str) -> Result<Option<u32>, HostNetworkError> {
        Ok(self.state.lock().unwrap().links.get(name).copied())
    }

    async fn attach(&self, link: u32, bridge: u32) -> Result<(), HostNetworkError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_attaches > 0 {
            state.failing_attaches -= 1;
            return Err(HostNetworkError::Netlink("injected attach failure".to_string()));
        }
        if !state.exists(link) {
            return Err(HostNetworkError::LinkNotFound(format!("index {link}")));
        }
        if !state.exists(bridge) {
            return Err(HostNetworkError::LinkNotFound(format!("index {bridge}")));
        }
        state.controllers.insert(link, bridge);
        Ok(())
    }

    async fn detach(&self, link: u32) -> Result<(), HostNetworkError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_detaches > 0 {
            state.failing_detaches -= 1;
            return Err(HostNetworkError::Netlink("injected detach failure".to_string()));
        }
        if !state.exists(link) {
            return Err(HostNetworkError::LinkNotFound(format!("index {link}")));
        }
        state.controllers.remove(&link);
        Ok(())
    }

    async fn set_up(&self, link: u32) -> Result<(), HostNetworkError> {
        let mut state = self.state.lock().unwrap();
        if !state.exists(link) {
            return Err(HostNetworkError::LinkNotFound(format!("index {link}")));
        }
        state.up.insert(link);
        Ok(())
    }
}
