use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::identity::RemoteBinding;
use crate::rate_limit::RateLimitConfig;

/// Where the address counter and the secret key are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory. State is lost on restart, which invalidates every
    /// identity token issued before it.
    #[default]
    Memory,
    Sqlite,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => anyhow::bail!("unknown storage backend: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    // Persistence
    pub storage: StorageBackend,
    pub database_path: PathBuf,

    // Identity
    pub identity_binding: RemoteBinding,

    // Requests and channels
    pub max_body_size: usize,
    pub channel_buffer: usize,
    pub channel_ttl_secs: u64,
    pub eviction_interval_secs: u64,

    // Rate limiting
    pub rate_limit: RateLimitConfig,
    pub allowlist: Vec<String>,
    pub blocklist: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            storage: StorageBackend::Memory,
            database_path: PathBuf::from("smoke-hub.db"),
            identity_binding: RemoteBinding::Socket,
            max_body_size: 64 * 1024, // 64KB
            channel_buffer: 64,
            channel_ttl_secs: 7200, // 2 hours
            eviction_interval_secs: 60,
            rate_limit: RateLimitConfig::default(),
            allowlist: Vec::new(),
            blocklist: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SMOKE_HUB_BIND_ADDR") {
            config.bind_addr = addr.parse()?;
        }

        if let Ok(storage) = std::env::var("SMOKE_HUB_STORAGE") {
            config.storage = storage.parse()?;
        }

        if let Ok(path) = std::env::var("SMOKE_HUB_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(binding) = std::env::var("SMOKE_HUB_IDENTITY_BINDING") {
            config.identity_binding = binding.parse().map_err(anyhow::Error::msg)?;
        }

        if let Ok(size) = std::env::var("SMOKE_HUB_MAX_BODY_SIZE") {
            config.max_body_size = size.parse()?;
        }

        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_body_size == 0 {
            anyhow::bail!("max_body_size must be > 0");
        }

        if self.channel_buffer == 0 {
            anyhow::bail!("channel_buffer must be > 0");
        }

        if self.channel_ttl_secs == 0 {
            anyhow::bail!("channel_ttl_secs must be > 0");
        }

        if self.eviction_interval_secs == 0 {
            anyhow::bail!("eviction_interval_secs must be > 0");
        }

        if self.storage == StorageBackend::Sqlite && self.database_path.as_os_str().is_empty() {
            anyhow::bail!("database_path must be set for the sqlite backend");
        }

        if self.rate_limit.connect_limit == 0 {
            anyhow::bail!("rate_limit.connect_limit must be > 0");
        }

        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be > 0");
        }

        for ip in self.allowlist.iter().chain(&self.blocklist) {
            if ip.parse::<std::net::IpAddr>().is_err() {
                anyhow::bail!("invalid IP address in allowlist/blocklist: {}", ip);
            }
        }

        Ok(())
    }

    pub fn channel_ttl(&self) -> Duration {
        Duration::from_secs(self.channel_ttl_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}
