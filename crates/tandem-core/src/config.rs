//! Centralized configuration for tandem.
//!
//! Transport limits and thread naming live here as associated constants so
//! the transport, the IPC thread and the endpoint harness agree on them.

use std::time::Duration;

/// Channel and transport limits.
pub struct ChannelConfig;

impl ChannelConfig {
    /// Host every listening channel binds to.
    pub const LISTEN_HOST: &'static str = "127.0.0.1";
    /// Largest frame body accepted from a peer.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Bound on establishing the client side of a channel.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Scheduler yields performed when draining the IPC thread to idle, so
    /// connection tasks get to flush queued frames before shutdown proceeds.
    pub const IO_DRAIN_YIELDS: usize = 8;
    /// Prefix for generated anonymous channel names.
    pub const ANONYMOUS_PREFIX: &'static str = "anon";
}

/// Thread naming for endpoints.
pub struct ThreadConfig;

impl ThreadConfig {
    pub const LISTENER_SUFFIX: &'static str = "_listener";
    pub const IPC_SUFFIX: &'static str = "_ipc";
}
