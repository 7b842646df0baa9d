//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`SOCKRPC_*`)
//!
//! ```toml
//! [client]
//! addresses = "10.0.0.1:7300,10.0.0.2:7300"
//! default_call_timeout_ms = 10000
//!
//! [server]
//! addr = "0.0.0.0:7300"
//! max_time_to_wait_for_request_completion_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::error::{Result, RpcError};
use crate::server::ServerConfig;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Client-role settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Server-role settings
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RpcError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `SOCKRPC_*` environment variables on top of `self`.
    ///
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        // Client settings
        if let Ok(addresses) = std::env::var("SOCKRPC_CLIENT_ADDRESSES") {
            self.client.addresses = addresses;
        }
        set_from_env("SOCKRPC_CLIENT_VERSION_MIN", &mut self.client.protocol_version_min);
        set_from_env("SOCKRPC_CLIENT_VERSION_MAX", &mut self.client.protocol_version_max);
        set_from_env(
            "SOCKRPC_CLIENT_KEEP_ALIVE_INTERVAL_MS",
            &mut self.client.keep_alive_interval_ms,
        );
        set_from_env(
            "SOCKRPC_CLIENT_KEEP_ALIVE_TIMEOUT_MS",
            &mut self.client.keep_alive_timeout_ms,
        );
        set_from_env("SOCKRPC_RECONNECT_INTERVAL_MS", &mut self.client.reconnect_interval_ms);
        set_from_env("SOCKRPC_DEFAULT_CALL_TIMEOUT_MS", &mut self.client.default_call_timeout_ms);
        set_from_env("SOCKRPC_CLIENT_ENUM_HARD_FAIL", &mut self.client.enum_hard_fail);

        // Server settings
        set_from_env("SOCKRPC_SERVER_ADDR", &mut self.server.addr);
        set_from_env("SOCKRPC_SERVER_VERSION_MIN", &mut self.server.protocol_version_min);
        set_from_env("SOCKRPC_SERVER_VERSION_MAX", &mut self.server.protocol_version_max);
        set_from_env(
            "SOCKRPC_SERVER_KEEP_ALIVE_INTERVAL_MS",
            &mut self.server.keep_alive_interval_ms,
        );
        set_from_env(
            "SOCKRPC_SERVER_KEEP_ALIVE_TIMEOUT_MS",
            &mut self.server.keep_alive_timeout_ms,
        );
        set_from_env(
            "SOCKRPC_MAX_TIME_TO_WAIT_FOR_REQUEST_COMPLETION_MS",
            &mut self.server.max_time_to_wait_for_request_completion_ms,
        );
        set_from_env("SOCKRPC_WORKER_POOL_SIZE", &mut self.server.worker_pool_size);
        set_from_env("SOCKRPC_SERVER_ENUM_HARD_FAIL", &mut self.server.enum_hard_fail);

        self
    }

    /// Default config file location (`<config dir>/sockrpc/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("sockrpc").join("config.toml"))
    }

    /// Load the default file if present, otherwise defaults, then apply the
    /// environment.
    pub fn load() -> Result<Self> {
        let base = match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "Loading config file");
                Self::from_file(path)?
            },
            _ => Self::default(),
        };
        let config = base.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Validate both role configurations.
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        self.server.validate()
    }
}

fn set_from_env<T: FromStr>(name: &str, slot: &mut T) {
    if let Some(value) = std::env::var(name).ok().and_then(|v| v.parse().ok()) {
        *slot = value;
    }
}
