//! MariaDB Database
//!
//! Connection pools and replication probes for MariaDB primaries and replicas.

use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row};

use super::{Connector, Database, HostAddress, WriteLocation};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// A lazily connecting MariaDB pool for one host
pub struct MariaDb {
    /// Address this pool connects to
    address: HostAddress,
    /// Options used to (re)build the pool
    options: MySqlConnectOptions,
    /// Pool settings
    pool_size: u32,
    acquire_timeout: std::time::Duration,
    /// Current pool; replaced on disconnect so the host can be used again later
    pool: RwLock<MySqlPool>,
}

impl MariaDb {
    /// Create a pool for `address` using the credentials in `config`.
    /// No connection is opened until the first query.
    pub fn connect_lazy(config: &DatabaseConfig, address: &HostAddress) -> Result<Self> {
        let mut options = MySqlConnectOptions::new()
            .host(&address.host)
            .port(address.port.unwrap_or(config.port))
            .username(&config.user)
            .password(&config.password);

        if let Some(db) = &config.database {
            options = options.database(db);
        }

        let pool_size = config.pool_size;
        let acquire_timeout = config.connect_timeout();
        let pool = build_pool(&options, pool_size, acquire_timeout);

        Ok(Self {
            address: address.clone(),
            options,
            pool_size,
            acquire_timeout,
            pool: RwLock::new(pool),
        })
    }

    /// The sqlx pool for running application queries
    pub fn pool(&self) -> MySqlPool {
        match self.pool.read() {
            Ok(pool) => pool.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Address of this host
    pub fn address(&self) -> &HostAddress {
        &self.address
    }

    async fn slave_status(&self) -> Result<Option<MySqlRow>> {
        let row = sqlx::query("SHOW SLAVE STATUS")
            .fetch_optional(&self.pool())
            .await?;
        Ok(row)
    }
}

fn build_pool(
    options: &MySqlConnectOptions,
    pool_size: u32,
    acquire_timeout: std::time::Duration,
) -> MySqlPool {
    MySqlPoolOptions::new()
        .max_connections(pool_size)
        .acquire_timeout(acquire_timeout)
        .connect_lazy_with(options.clone())
}

/// Read an unsigned integer column that MariaDB may report as signed,
/// unsigned or text depending on the protocol in use
fn column_u64(row: &MySqlRow, name: &str) -> Option<u64> {
    if let Ok(value) = row.try_get::<Option<u64>, _>(name) {
        return value;
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(name) {
        return value.map(|v| v.max(0) as u64);
    }
    row.try_get::<Option<String>, _>(name)
        .ok()
        .flatten()
        .and_then(|v| v.trim().parse().ok())
}

fn column_string(row: &MySqlRow, name: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(name).ok().flatten()
}

#[async_trait]
impl Database for MariaDb {
    async fn replication_lag_time(&self) -> Result<Option<f64>> {
        match self.slave_status().await? {
            // Not a replica, so nothing to lag behind
            None => Ok(Some(0.0)),
            Some(row) => Ok(column_u64(&row, "Seconds_Behind_Master").map(|s| s as f64)),
        }
    }

    async fn replication_lag_size(&self) -> Result<Option<u64>> {
        let row = match self.slave_status().await? {
            None => return Ok(Some(0)),
            Some(row) => row,
        };

        // Positions are only comparable within the same binlog file
        let master_file = column_string(&row, "Master_Log_File");
        let relay_master_file = column_string(&row, "Relay_Master_Log_File");
        if master_file.is_none() || master_file != relay_master_file {
            return Ok(None);
        }

        let read = column_u64(&row, "Read_Master_Log_Pos");
        let exec = column_u64(&row, "Exec_Master_Log_Pos");
        Ok(match (read, exec) {
            (Some(read), Some(exec)) => Some(read.saturating_sub(exec)),
            _ => None,
        })
    }

    async fn caught_up_to(&self, location: &WriteLocation) -> Result<bool> {
        if self.slave_status().await?.is_none() {
            return Ok(true);
        }

        let waited: (Option<i64>,) = sqlx::query_as("SELECT MASTER_GTID_WAIT(?, 0)")
            .bind(location.as_str())
            .fetch_one(&self.pool())
            .await?;

        Ok(waited.0 == Some(0))
    }

    async fn write_location(&self) -> Result<Option<WriteLocation>> {
        let row: (Option<String>,) = sqlx::query_as("SELECT @@global.gtid_binlog_pos")
            .fetch_one(&self.pool())
            .await?;

        Ok(row
            .0
            .filter(|pos| !pos.trim().is_empty())
            .map(WriteLocation::new))
    }

    fn release_connections(&self) {
        // sqlx returns connections to the pool when they are dropped, so
        // nothing is held past the end of a query
    }

    fn connections_in_use(&self) -> usize {
        let pool = self.pool();
        (pool.size() as usize).saturating_sub(pool.num_idle())
    }

    async fn disconnect(&self) {
        let fresh = build_pool(&self.options, self.pool_size, self.acquire_timeout);
        let old = match self.pool.write() {
            Ok(mut pool) => std::mem::replace(&mut *pool, fresh),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), fresh),
        };

        tracing::debug!("Closing connection pool for {}", self.address);
        old.close().await;
    }
}

/// Builds MariaDB pools sharing the primary's credentials
#[derive(Debug, Clone)]
pub struct MariaDbConnector {
    config: DatabaseConfig,
}

impl MariaDbConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

impl Connector for MariaDbConnector {
    type Database = MariaDb;

    fn connect(&self, address: &HostAddress) -> Result<MariaDb> {
        if address.host.is_empty() {
            return Err(Error::Config("cannot connect to an empty host".into()));
        }
        MariaDb::connect_lazy(&self.config, address)
    }
}
