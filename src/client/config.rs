//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DecodeOptions;
use crate::error::{Result, RpcError};
use crate::protocol::VersionRange;
use crate::transport::parse_address_list;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Candidate servers, comma-separated `host:port`
    pub addresses: String,
    /// Lowest protocol version offered
    pub protocol_version_min: u8,
    /// Highest protocol version offered
    pub protocol_version_max: u8,
    /// Send a heartbeat after this much write-idle time
    pub keep_alive_interval_ms: u64,
    /// Drop the session after this much read-idle time
    pub keep_alive_timeout_ms: u64,
    /// Wait between reconnection passes
    pub reconnect_interval_ms: u64,
    /// Call timeout when the caller does not give one
    pub default_call_timeout_ms: u64,
    /// TCP connect timeout per resolved address
    pub connect_timeout_ms: u64,
    /// Time allowed for the HANDSHAKE_ACK
    pub handshake_timeout_ms: u64,
    /// How long `start()` waits for a first session
    pub start_timeout_ms: u64,
    /// Period of the expired-call sweep
    pub sweep_interval_ms: u64,
    /// Default enum policy for decoding results
    pub enum_hard_fail: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addresses: "127.0.0.1:7300".to_string(),
            protocol_version_min: 1,
            protocol_version_max: 5,
            keep_alive_interval_ms: 5_000,
            keep_alive_timeout_ms: 15_000,
            reconnect_interval_ms: 1_000,
            default_call_timeout_ms: 30_000,
            connect_timeout_ms: 2_000,
            handshake_timeout_ms: 5_000,
            start_timeout_ms: 10_000,
            sweep_interval_ms: 50,
            enum_hard_fail: false,
        }
    }
}

impl ClientConfig {
    /// Set the candidate address list
    pub fn with_addresses(mut self, addresses: &str) -> Self {
        self.addresses = addresses.to_string();
        self
    }

    /// Set the offered version range
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

    /// Set the reconnect interval
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the default call timeout
    pub fn with_default_call_timeout(mut self, timeout: Duration) -> Self {
        self.default_call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the `start()` window
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the default enum policy
    pub fn with_enum_hard_fail(mut self, hard_fail: bool) -> Self {
        self.enum_hard_fail = hard_fail;
        self
    }

    /// Parsed candidate addresses
    pub fn address_list(&self) -> Vec<String> {
        parse_address_list(&self.addresses)
    }

    /// Offered version range
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

    /// Reconnect interval
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Default call timeout
    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// `start()` window
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Default decode options
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            enum_hard_fail: self.enum_hard_fail,
        }
    }

    /// Check for inconsistent values.
    pub fn validate(&self) -> Result<()> {
        self.version_range()?;
        if self.address_list().is_empty() {
            return Err(RpcError::Config("client address list is empty".to_string()));
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(RpcError::Config("keep_alive_interval_ms must be > 0".to_string()));
        }
        if self.keep_alive_timeout_ms <= self.keep_alive_interval_ms {
            return Err(RpcError::Config(format!(
                "keep_alive_timeout_ms ({}) must exceed keep_alive_interval_ms ({})",
                self.keep_alive_timeout_ms, self.keep_alive_interval_ms
            )));
        }
        if self.default_call_timeout_ms == 0 {
            return Err(RpcError::Config("default_call_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }
}
