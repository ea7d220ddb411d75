//! Database Module
//!
//! The engine-facing side of the load balancer. A [`Database`] is one
//! connection pool to one host and answers the replication queries the
//! balancer needs; a [`Connector`] builds pools for addresses found in the
//! configuration or through service discovery.

mod mariadb;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use mariadb::{MariaDb, MariaDbConnector};

/// Replication position of a host.
///
/// Opaque to the balancer: positions are only ever compared by asking a host
/// whether it has replayed up to one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriteLocation(String);

impl WriteLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WriteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WriteLocation {
    fn from(location: String) -> Self {
        Self(location)
    }
}

/// Role of a connection pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbRole {
    Primary,
    Replica,
}

impl fmt::Display for DbRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbRole::Primary => write!(f, "PRIMARY"),
            DbRole::Replica => write!(f, "REPLICA"),
        }
    }
}

/// Host and optional port of a database server
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: Option<u16>,
}

impl HostAddress {
    pub fn new(host: String, port: Option<u16>) -> Self {
        Self { host, port }
    }

    /// Parse "host" or "host:port"
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::Config("host address cannot be empty".into()));
        }

        match address.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid port in host address: {}", address)))?;
                Ok(Self::new(host.to_string(), Some(port)))
            }
            _ => Ok(Self::new(address.to_string(), None)),
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// A connection pool to a single database host.
///
/// Probe methods return errors as-is; callers decide whether to swallow them.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Seconds this host lags behind its primary, `None` when unknown
    async fn replication_lag_time(&self) -> Result<Option<f64>>;

    /// Bytes of replication data received but not yet replayed, `None` when unknown
    async fn replication_lag_size(&self) -> Result<Option<u64>>;

    /// Whether this host has replayed at least up to `location`.
    /// A host that is not replicating from anything is always caught up.
    async fn caught_up_to(&self, location: &WriteLocation) -> Result<bool>;

    /// Current write location when this host acts as a primary
    async fn write_location(&self) -> Result<Option<WriteLocation>>;

    /// Return connections held by the current caller to the pool
    fn release_connections(&self);

    /// Number of connections currently checked out
    fn connections_in_use(&self) -> usize;

    /// Drop every pooled connection
    async fn disconnect(&self);
}

/// Builds connection pools for host addresses
pub trait Connector: Send + Sync + 'static {
    type Database: Database;

    fn connect(&self, address: &HostAddress) -> Result<Self::Database>;
}
