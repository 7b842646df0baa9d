//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DecodeOptions;
use crate::error::{Result, RpcError};
use crate::protocol::VersionRange;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub addr: SocketAddr,
    /// Lowest protocol version accepted
    pub protocol_version_min: u8,
    /// Highest protocol version accepted
    pub protocol_version_max: u8,
    /// Send a heartbeat after this much write-idle time
    pub keep_alive_interval_ms: u64,
    /// Drop a session after this much read-idle time
    pub keep_alive_timeout_ms: u64,
    /// Drain window after going unhealthy, 0 disconnects immediately
    pub max_time_to_wait_for_request_completion_ms: u64,
    /// How often a draining session's outstanding count is checked
    pub drain_poll_interval_ms: u64,
    /// Time allowed for the client's HANDSHAKE
    pub handshake_timeout_ms: u64,
    /// Concurrent handler limit
    pub worker_pool_size: usize,
    /// Enum policy for decoding arguments
    pub enum_hard_fail: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 7300)),
            protocol_version_min: 1,
            protocol_version_max: 5,
            keep_alive_interval_ms: 5_000,
            keep_alive_timeout_ms: 15_000,
            max_time_to_wait_for_request_completion_ms: 5_000,
            drain_poll_interval_ms: 25,
            handshake_timeout_ms: 5_000,
            worker_pool_size: 64,
            enum_hard_fail: false,
        }
    }
}

impl ServerConfig {
    /// Listen on `127.0.0.1:port`; 0 picks a free port
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Bind to all interfaces
    pub fn bind_all(mut self) -> Self {
        self.addr = SocketAddr::from(([0, 0, 0, 0], self.addr.port()));
        self
    }

    /// Set address directly
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Set the accepted version range
    pub fn with_versions(mut self, min: u8, max: u8) -> Self {
        self.protocol_version_min = min;
        self.protocol_version_max = max;
        self
    }

    /// Set keep-alive interval and timeout
    pub fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive_interval_ms = interval.as_millis() as u64;
        self.keep_alive_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the drain window
    pub fn with_drain_timeout(mut self, wait: Duration) -> Self {
        self.max_time_to_wait_for_request_completion_ms = wait.as_millis() as u64;
        self
    }

    /// Set the handler concurrency limit
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set the enum policy
    pub fn with_enum_hard_fail(mut self, hard_fail: bool) -> Self {
        self.enum_hard_fail = hard_fail;
        self
    }

    /// Accepted version range
    pub fn version_range(&self) -> Result<VersionRange> {
        VersionRange::new(self.protocol_version_min, self.protocol_version_max)
    }

    /// Keep-alive interval
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Keep-alive timeout
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    /// Drain window
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.max_time_to_wait_for_request_completion_ms)
    }

    /// Drain poll period
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms.max(1))
    }

    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Decode options for inbound arguments
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            enum_hard_fail: self.enum_hard_fail,
        }
    }

    /// Check for inconsistent values.
    pub fn validate(&self) -> Result<()> {
        self.version_range()?;
        if self.keep_alive_interval_ms == 0 {
            return Err(RpcError::Config("keep_alive_interval_ms must be > 0".to_string()));
        }
        if self.keep_alive_timeout_ms <= self.keep_alive_interval_ms {
            return Err(RpcError::Config(format!(
                "keep_alive_timeout_ms ({}) must exceed keep_alive_interval_ms ({})",
                self.keep_alive_timeout_ms, self.keep_alive_interval_ms
            )));
        }
        if self.worker_pool_size == 0 {
            return Err(RpcError::Config("worker_pool_size must be > 0".to_string()));
        }
        Ok(())
    }
}
