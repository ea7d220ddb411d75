//! Replica Host
//!
//! Wraps the connection pool of a single replica and tracks whether it may
//! be read from.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::WolfBalanceConfig;
use crate::database::{Database, HostAddress, WriteLocation};

/// How often `disconnect` checks for connections still in use
const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Health thresholds applied to every replica
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplicaLimits {
    /// Replicas lagging more than this are unhealthy
    pub max_lag_time: Duration,
    /// Replicas with more unreplayed data than this (bytes) are unhealthy
    pub max_lag_size: u64,
    /// Minimum time between health checks; each check waits a random
    /// duration between this and twice this
    pub check_interval: Duration,
}

impl Default for ReplicaLimits {
    fn default() -> Self {
        Self {
            max_lag_time: Duration::from_secs(60),
            max_lag_size: 8 * 1024 * 1024,
            check_interval: Duration::from_secs(60),
        }
    }
}

impl ReplicaLimits {
    pub fn from_config(config: &WolfBalanceConfig) -> Self {
        Self {
            max_lag_time: config.max_replication_lag_time(),
            max_lag_size: config.load_balancing.max_replication_difference,
            check_interval: config.replica_check_interval(),
        }
    }

    /// Range the next health check delay is sampled from
    pub fn check_interval_range(&self) -> RangeInclusive<Duration> {
        self.check_interval..=self.check_interval * 2
    }

    pub fn lag_time_acceptable(&self, lag: Option<f64>) -> bool {
        matches!(lag, Some(secs) if secs <= self.max_lag_time.as_secs_f64())
    }

    pub fn lag_size_acceptable(&self, lag: Option<u64>) -> bool {
        matches!(lag, Some(bytes) if bytes <= self.max_lag_size)
    }

    /// Healthy when either the time lag or the byte lag is acceptable
    pub fn accepts(&self, lag_time: Option<f64>, lag_size: Option<u64>) -> bool {
        self.lag_time_acceptable(lag_time) || self.lag_size_acceptable(lag_size)
    }
}

/// A single replica
pub struct Host<D> {
    address: HostAddress,
    database: Arc<D>,
    online: AtomicBool,
    last_checked_at: Mutex<Instant>,
    limits: ReplicaLimits,
}

impl<D: Database> Host<D> {
    /// Create a host. New hosts start online and are first checked after
    /// one check interval.
    pub fn new(address: HostAddress, database: D, limits: ReplicaLimits) -> Self {
        Self {
            address,
            database: Arc::new(database),
            online: AtomicBool::new(true),
            last_checked_at: Mutex::new(Instant::now()),
            limits,
        }
    }

    pub fn address(&self) -> &HostAddress {
        &self.address
    }

    pub fn database(&self) -> &Arc<D> {
        &self.database
    }

    /// Last known state, without checking the replica
    pub fn last_known_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Whether this replica can be read from. Uses the cached state until
    /// the jittered check interval has passed, then checks the replica.
    pub async fn online(&self) -> bool {
        if !self.check_due() {
            return self.online.load(Ordering::SeqCst);
        }

        let was_online = self.online.load(Ordering::SeqCst);
        let up_to_date = self.replica_is_up_to_date().await;

        self.online.store(up_to_date, Ordering::SeqCst);
        *self.checked_at() = Instant::now();

        if up_to_date && !was_online {
            tracing::info!(
                db_host = %self.address,
                "Host is online after replica status check"
            );
        } else if !up_to_date && was_online {
            tracing::warn!(
                db_host = %self.address,
                "Host is offline after replica status check"
            );
            self.database.disconnect().await;
        }

        up_to_date
    }

    /// Mark this host offline and drop its connections so nothing picks up
    /// a broken connection
    pub async fn offline(&self) {
        tracing::warn!(db_host = %self.address, "Marking host as offline");

        self.online.store(false, Ordering::SeqCst);
        *self.checked_at() = Instant::now();
        self.database.disconnect().await;
    }

    /// Whether this host replayed at least up to `location`. Errors count
    /// as not caught up.
    pub async fn caught_up(&self, location: &WriteLocation) -> bool {
        let result = self.database.caught_up_to(location).await;
        self.database.release_connections();

        match result {
            Ok(caught_up) => caught_up,
            Err(e) => {
                tracing::debug!("Catch-up check on {} failed: {}", self.address, e);
                false
            }
        }
    }

    /// Give in-use connections up to `timeout` to finish, then disconnect
    pub async fn disconnect(&self, timeout: Duration) {
        let started = Instant::now();

        while started.elapsed() <= timeout {
            if self.database.connections_in_use() == 0 {
                break;
            }
            tokio::time::sleep(DISCONNECT_POLL_INTERVAL).await;
        }

        self.database.disconnect().await;
    }

    pub fn release_connection(&self) {
        self.database.release_connections();
    }

    fn check_due(&self) -> bool {
        let elapsed = self.checked_at().elapsed();
        elapsed >= self.sample_check_interval()
    }

    fn sample_check_interval(&self) -> Duration {
        let range = self.limits.check_interval_range();
        let secs = rand::thread_rng().gen_range(range.start().as_secs_f64()..=range.end().as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Healthy when either the time lag or the byte lag is acceptable.
    /// A primary without recent writes stops advancing the replica's replay
    /// timestamp, so time lag alone would wrongly flag a current replica.
    async fn replica_is_up_to_date(&self) -> bool {
        self.replication_lag_below_threshold().await || self.data_is_recent_enough().await
    }

    async fn replication_lag_below_threshold(&self) -> bool {
        let lag = self.database.replication_lag_time().await;
        self.database.release_connections();

        match lag {
            Ok(secs) => self.limits.lag_time_acceptable(secs),
            Err(e) => {
                tracing::debug!("Lag time check on {} failed: {}", self.address, e);
                false
            }
        }
    }

    async fn data_is_recent_enough(&self) -> bool {
        let lag = self.database.replication_lag_size().await;
        self.database.release_connections();

        match lag {
            Ok(bytes) => self.limits.lag_size_acceptable(bytes),
            Err(e) => {
                tracing::debug!("Lag size check on {} failed: {}", self.address, e);
                false
            }
        }
    }

    fn checked_at(&self) -> std::sync::MutexGuard<'_, Instant> {
        match self.last_checked_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<D> std::fmt::Debug for Host<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("online", &self.online.load(Ordering::SeqCst))
            .finish()
    }
}
