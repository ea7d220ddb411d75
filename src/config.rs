//! WolfBalance Configuration
//!
//! Configuration structures for the primary database, the replica load
//! balancer, DNS service discovery and cross-request sticking.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::database::HostAddress;

/// Main WolfBalance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfBalanceConfig {
    /// Primary (read-write) database
    pub primary: DatabaseConfig,

    /// Replica load balancing configuration
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,

    /// Sticking configuration
    #[serde(default)]
    pub sticking: StickingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database connection configuration
///
/// Replicas reuse everything but the host and port of the primary's config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// MariaDB host
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    #[serde(default)]
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name
    #[serde(default)]
    pub database: Option<String>,

    /// Connection pool size (per host)
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Replica load balancing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    /// Statically configured replica hosts ("host" or "host:port")
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Maximum replication difference in bytes before a replica is unhealthy
    #[serde(default = "default_max_replication_difference")]
    pub max_replication_difference: u64,

    /// Maximum replication lag in seconds before a replica is unhealthy
    #[serde(default = "default_max_replication_lag_time")]
    pub max_replication_lag_time: u64,

    /// Minimum seconds between replica health checks
    #[serde(default = "default_replica_check_interval")]
    pub replica_check_interval: u64,

    /// DNS service discovery
    #[serde(default)]
    pub discover: DiscoverConfig,
}

/// DNS service discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverConfig {
    /// Nameserver to query
    #[serde(default = "default_nameserver")]
    pub nameserver: String,

    /// Nameserver port
    #[serde(default = "default_nameserver_port")]
    pub port: u16,

    /// Record to resolve; discovery is disabled when unset
    #[serde(default)]
    pub record: Option<String>,

    /// Record type ("A" or "SRV")
    #[serde(default = "default_record_type")]
    pub record_type: String,

    /// Minimum seconds between lookups
    #[serde(default = "default_discover_interval")]
    pub interval: u64,

    /// Seconds to wait for in-use connections before disconnecting removed hosts
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout: u64,

    /// Query the nameserver over TCP instead of UDP
    #[serde(default)]
    pub use_tcp: bool,
}

/// Sticking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickingConfig {
    /// Seconds a recorded write location is kept
    #[serde(default = "default_sticking_expiration")]
    pub expiration_secs: u64,

    /// Store backend ("memory" or "sqlite")
    #[serde(default = "default_store")]
    pub store: String,

    /// SQLite database path (sqlite store only)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_db_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_replication_difference() -> u64 {
    8 * 1024 * 1024
}

fn default_max_replication_lag_time() -> u64 {
    60
}

fn default_replica_check_interval() -> u64 {
    60
}

fn default_nameserver() -> String {
    "localhost".to_string()
}

fn default_nameserver_port() -> u16 {
    8600
}

fn default_record_type() -> String {
    "A".to_string()
}

fn default_discover_interval() -> u64 {
    60
}

fn default_disconnect_timeout() -> u64 {
    120
}

fn default_sticking_expiration() -> u64 {
    30
}

fn default_store() -> String {
    "memory".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/wolfbalance/sticking.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            max_replication_difference: default_max_replication_difference(),
            max_replication_lag_time: default_max_replication_lag_time(),
            replica_check_interval: default_replica_check_interval(),
            discover: DiscoverConfig::default(),
        }
    }
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            nameserver: default_nameserver(),
            port: default_nameserver_port(),
            record: None,
            record_type: default_record_type(),
            interval: default_discover_interval(),
            disconnect_timeout: default_disconnect_timeout(),
            use_tcp: false,
        }
    }
}

impl Default for StickingConfig {
    fn default() -> Self {
        Self {
            expiration_secs: default_sticking_expiration(),
            store: default_store(),
            path: default_store_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WolfBalanceConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfBalanceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.primary.host.is_empty() {
            return Err(crate::Error::Config("primary.host cannot be empty".into()));
        }

        if self.primary.pool_size == 0 {
            return Err(crate::Error::Config("primary.pool_size must be positive".into()));
        }

        let lb = &self.load_balancing;
        if lb.replica_check_interval == 0 {
            return Err(crate::Error::Config(
                "load_balancing.replica_check_interval must be positive".into(),
            ));
        }

        for host in &lb.hosts {
            HostAddress::parse(host)?;
        }

        if lb.discover.interval == 0 {
            return Err(crate::Error::Config(
                "load_balancing.discover.interval must be positive".into(),
            ));
        }

        match lb.discover.record_type.to_uppercase().as_str() {
            "A" | "SRV" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "unsupported discovery record type: {}",
                    other
                )))
            }
        }

        match self.sticking.store.as_str() {
            "memory" | "sqlite" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "unknown sticking store: {}",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Check whether load balancing should be used at all
    pub fn load_balancing_enabled(&self) -> bool {
        !self.load_balancing.hosts.is_empty() || self.service_discovery_enabled()
    }

    /// Check whether replicas are discovered through DNS
    pub fn service_discovery_enabled(&self) -> bool {
        self.load_balancing.discover.record.is_some()
    }

    /// Statically configured replica addresses
    pub fn replica_addresses(&self) -> crate::Result<Vec<HostAddress>> {
        self.load_balancing
            .hosts
            .iter()
            .map(|h| HostAddress::parse(h))
            .collect()
    }

    /// Address of the primary database
    pub fn primary_address(&self) -> HostAddress {
        HostAddress::new(self.primary.host.clone(), Some(self.primary.port))
    }

    /// Get the replica health check interval as Duration
    pub fn replica_check_interval(&self) -> Duration {
        Duration::from_secs(self.load_balancing.replica_check_interval)
    }

    /// Get the maximum replication lag as Duration
    pub fn max_replication_lag_time(&self) -> Duration {
        Duration::from_secs(self.load_balancing.max_replication_lag_time)
    }

    /// Get the sticking expiration as Duration
    pub fn sticking_expiration(&self) -> Duration {
        Duration::from_secs(self.sticking.expiration_secs)
    }
}

impl DiscoverConfig {
    /// Get the lookup interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Get the disconnect timeout as Duration
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout)
    }
}

impl DatabaseConfig {
    /// Get the pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
