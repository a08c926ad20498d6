//! Replication configuration

use crate::replication::DEFAULT_REPLICATION_PORT;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Address to bind for replication connections
    pub bind_addr: SocketAddr,

    /// Connection timeout for outbound connections
    #[serde(with = "serde_millis")]
    pub connect_timeout: Duration,

    /// How long to wait for each ACK/NAK during catch-up
    #[serde(with = "serde_millis")]
    pub ack_timeout: Duration,

    /// Maximum number of inbound connections handled at once
    pub max_connections: usize,

    /// Broadcast messages buffered per slave before it is dropped as dead
    pub slave_channel_capacity: usize,

    /// Largest accepted frame, in bytes
    pub max_frame_length: usize,

    /// First delay before a slave re-opens its subscription
    #[serde(with = "serde_millis")]
    pub reconnect_initial_delay: Duration,

    /// Cap for the slave reconnect backoff
    #[serde(with = "serde_millis")]
    pub reconnect_max_delay: Duration,

    /// Consecutive failed full resyncs before the node gives up
    pub max_full_resync_attempts: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_REPLICATION_PORT)),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            max_connections: 256,
            slave_channel_capacity: 1024,
            max_frame_length: 64 * 1024 * 1024,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            max_full_resync_attempts: 3,
        }
    }
}

impl ReplicationConfig {
    /// Set the catch-up acknowledgement timeout
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the reconnect backoff bounds
    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_max_delay = max;
        self
    }

    /// Set the per-slave broadcast buffer
    pub fn with_slave_channel_capacity(mut self, capacity: usize) -> Self {
        self.slave_channel_capacity = capacity;
        self
    }

    /// Set the full-resync attempt limit
    pub fn with_max_full_resync_attempts(mut self, attempts: u32) -> Self {
        self.max_full_resync_attempts = attempts;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".into());
        }

        if self.slave_channel_capacity == 0 {
            return Err("slave_channel_capacity must be at least 1".into());
        }

        if self.max_frame_length < 64 {
            return Err("max_frame_length must be at least 64 bytes".into());
        }

        if self.ack_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err("timeouts must be non-zero".into());
        }

        if self.reconnect_initial_delay.is_zero() {
            return Err("reconnect_initial_delay must be non-zero".into());
        }

        if self.reconnect_initial_delay > self.reconnect_max_delay {
            return Err("reconnect_initial_delay must not exceed reconnect_max_delay".into());
        }

        if self.max_full_resync_attempts == 0 {
            return Err("max_full_resync_attempts must be at least 1".into());
        }

        Ok(())
    }
}
