//! Name → address registry for listening channels.
//!
//! A server publishes the address it is listening on under its channel name;
//! a client resolves the name when it connects. The directory is passed
//! explicitly to every endpoint that should see the same set of names.

use crate::config::ChannelConfig;
use crate::{Result, TandemError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::debug;

/// Channel name as used for listen/connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A fresh name no other endpoint will pick by accident.
    pub fn anonymous() -> Self {
        Self(format!(
            "{}-{}",
            ChannelConfig::ANONYMOUS_PREFIX,
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// In-process registry of listening channels.
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    entries: Mutex<HashMap<ChannelName, SocketAddr>>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a listening address. A later publish under the same name
    /// replaces the earlier one.
    pub fn publish(&self, name: &ChannelName, addr: SocketAddr) {
        debug!("Channel {} listening on {}", name, addr);
        self.entries.lock().insert(name.clone(), addr);
    }

    pub fn resolve(&self, name: &ChannelName) -> Result<SocketAddr> {
        self.entries
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| TandemError::UnknownChannel {
                name: name.to_string(),
            })
    }

    /// Remove a name, but only if it still points at `addr`.
    pub fn withdraw(&self, name: &ChannelName, addr: SocketAddr) {
        let mut entries = self.entries.lock();
        if entries.get(name) == Some(&addr) {
            entries.remove(name);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
