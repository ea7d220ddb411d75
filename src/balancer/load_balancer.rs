//! Load Balancer
//!
//! Sends reads to replicas, writes to the primary, and decides what to do
//! when a host fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use super::host::{Host, ReplicaLimits};
use super::host_list::HostList;
use super::scope::RequestScope;
use crate::config::WolfBalanceConfig;
use crate::database::{Connector, Database, DbRole, WriteLocation};
use crate::error::{Error, Result};

/// Each replica may hit a replication conflict this many times per read
/// before the read goes to the primary
const CONFLICT_ROUNDS_PER_HOST: usize = 3;

/// Upper bound on a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Retry settings for operations on the primary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Delay after failed attempt `attempt` (zero-based): the base delay
/// multiplied by `2^(2^attempt - 1)`, i.e. 2s, 4s, 16s for a 2s base.
/// Never shrinks between attempts.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = 2f64.powi(attempt.min(16) as i32) - 1.0;
    let secs = base.as_secs_f64() * 2f64.powf(exponent);

    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Routes operations between the primary and the replicas
pub struct LoadBalancer<D> {
    primary: Arc<D>,
    host_list: HostList<D>,
    limits: ReplicaLimits,
    retry: RetryPolicy,
}

impl<D: Database> LoadBalancer<D> {
    pub fn new(
        primary: D,
        hosts: Vec<Arc<Host<D>>>,
        limits: ReplicaLimits,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            primary: Arc::new(primary),
            host_list: HostList::new(hosts),
            limits,
            retry,
        }
    }

    /// Build a balancer for the primary and static replicas in `config`
    pub fn from_config<C>(connector: &C, config: &WolfBalanceConfig) -> Result<Self>
    where
        C: Connector<Database = D>,
    {
        let limits = ReplicaLimits::from_config(config);
        let primary = connector.connect(&config.primary_address())?;

        let hosts = config
            .replica_addresses()?
            .into_iter()
            .map(|address| {
                let db = connector.connect(&address)?;
                Ok(Arc::new(Host::new(address, db, limits)))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            "Load balancer configured with primary {} and {} replica(s)",
            config.primary_address(),
            hosts.len()
        );

        Ok(Self::new(primary, hosts, limits, RetryPolicy::default()))
    }

    pub fn primary(&self) -> &Arc<D> {
        &self.primary
    }

    pub fn host_list(&self) -> &HostList<D> {
        &self.host_list
    }

    pub fn limits(&self) -> ReplicaLimits {
        self.limits
    }

    /// Replica used by this unit of work, picking one on first use
    pub async fn host(&self, scope: &RequestScope<D>) -> Option<Arc<Host<D>>> {
        if let Some(host) = scope.cached_host() {
            return Some(host);
        }

        let host = self.host_list.next().await?;
        scope.cache_host(Arc::clone(&host));
        Some(host)
    }

    /// Forget the replica of this unit of work so the next read picks another
    pub fn release_host(&self, scope: &RequestScope<D>) {
        if let Some(host) = scope.take_host() {
            host.release_connection();
        }
    }

    pub fn release_primary_connection(&self) {
        self.primary.release_connections();
    }

    /// Run a read on a replica.
    ///
    /// Replication conflicts move the read to another replica, connection
    /// errors take the replica offline first. Other errors are returned as
    /// they are. Without a usable replica the read runs on the primary.
    pub async fn read<F, Fut, T>(&self, scope: &RequestScope<D>, mut f: F) -> Result<T>
    where
        F: FnMut(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut conflicts = 0usize;

        while let Some(host) = self.host(scope).await {
            match f(Arc::clone(host.database())).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_serialization_failure() => {
                    conflicts += 1;
                    let host_list_length = self.host_list.len();
                    let will_retry = conflicts < host_list_length * CONFLICT_ROUNDS_PER_HOST;

                    tracing::warn!(
                        request_id = %scope.id(),
                        db_host = %host.address(),
                        conflicts,
                        will_retry,
                        host_list_length,
                        "Query conflict on host"
                    );

                    self.release_host(scope);
                    if !will_retry {
                        break;
                    }
                }
                Err(e) if e.is_connection_error() => {
                    tracing::debug!("Read on {} failed: {}", host.address(), e);
                    host.offline().await;
                    self.release_host(scope);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            request_id = %scope.id(),
            conflicts,
            host_list_length = self.host_list.len(),
            "No secondaries were available, using primary instead"
        );

        self.read_write(f).await
    }

    /// Run an operation on the primary, retrying connection errors with
    /// exponential backoff. The primary may briefly disappear during a
    /// failover.
    pub async fn read_write<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(Arc<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..self.retry.attempts {
            match f(Arc::clone(&self.primary)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connection_error() => {
                    // Don't keep a broken connection around for the retry
                    self.release_primary_connection();

                    if attempt + 1 < self.retry.attempts {
                        let delay = backoff_delay(self.retry.base_delay, attempt);
                        tracing::warn!(
                            "Primary connection failed (attempt {}/{}), retrying in {:?}: {}",
                            attempt + 1,
                            self.retry.attempts,
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("primary retry policy allows no attempts".into())))
    }

    /// Current write location of the primary
    pub async fn primary_write_location(&self) -> Result<WriteLocation> {
        let location = self
            .read_write(|db| async move { db.write_location().await })
            .await;
        self.release_primary_connection();

        location?.ok_or(Error::NoWriteLocation)
    }

    /// Whether every replica has replayed up to `location`. Replicas are
    /// checked concurrently.
    pub async fn all_caught_up(&self, location: &WriteLocation) -> bool {
        let hosts = self.host_list.hosts();
        let checks = hosts.iter().map(|host| host.caught_up(location));

        join_all(checks).await.into_iter().all(|caught_up| caught_up)
    }

    /// Role of a connection pool handed out by this balancer
    pub fn db_role_for(&self, database: &Arc<D>) -> Option<DbRole> {
        if Arc::ptr_eq(database, &self.primary) {
            Some(DbRole::Primary)
        } else if self.host_list.manages(database) {
            Some(DbRole::Replica)
        } else {
            None
        }
    }
}
