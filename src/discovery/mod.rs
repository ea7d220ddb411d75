//! Service Discovery Module
//!
//! Periodically resolves the replica set from DNS and swaps it into the
//! load balancer when it changes. Replaced hosts get a grace period to
//! finish in-flight work before their pools are closed.

mod dns;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

use crate::balancer::{Host, LoadBalancer};
use crate::config::DiscoverConfig;
use crate::database::{Connector, HostAddress};
use crate::error::Result;

pub use dns::{DnsResolver, RecordType};

/// Bounds of the random wait after a failed discovery round, in seconds
const RETRY_DELAY_RANGE: std::ops::RangeInclusive<u64> = 1..=5;

/// Result of one lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub addresses: Vec<HostAddress>,
    /// TTL of the first answer record
    pub ttl: Option<Duration>,
}

/// Source of replica addresses
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self) -> Result<Resolution>;
}

/// Keeps the load balancer's replica set in sync with DNS
pub struct ServiceDiscovery<C: Connector, R> {
    connector: Arc<C>,
    resolver: R,
    load_balancer: Arc<LoadBalancer<C::Database>>,
    /// Minimum time between lookups
    interval: Duration,
    /// Grace period for replaced hosts
    disconnect_timeout: Duration,
    running: RwLock<bool>,
    wakeup: Notify,
}

impl<C: Connector> ServiceDiscovery<C, DnsResolver> {
    /// Discovery against the DNS record in `config`
    pub fn from_config(
        connector: Arc<C>,
        load_balancer: Arc<LoadBalancer<C::Database>>,
        config: &DiscoverConfig,
    ) -> Result<Self> {
        Ok(Self::new(
            connector,
            DnsResolver::from_config(config)?,
            load_balancer,
            config.interval(),
            config.disconnect_timeout(),
        ))
    }
}

impl<C: Connector, R: Resolver> ServiceDiscovery<C, R> {
    pub fn new(
        connector: Arc<C>,
        resolver: R,
        load_balancer: Arc<LoadBalancer<C::Database>>,
        interval: Duration,
        disconnect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            resolver,
            load_balancer,
            interval,
            disconnect_timeout,
            running: RwLock::new(false),
            wakeup: Notify::new(),
        }
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer<C::Database>> {
        &self.load_balancer
    }

    /// Run discovery rounds in the background until [`stop`](Self::stop).
    /// The first round runs immediately.
    pub async fn start(self: Arc<Self>) -> JoinHandle<()> {
        *self.running.write().await = true;

        tokio::spawn(async move {
            loop {
                if !*self.running.read().await {
                    break;
                }

                let wait = self.perform_service_discovery().await;
                tracing::trace!("Next service discovery round in {:?}", wait);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.wakeup.notified() => {}
                }
            }

            tracing::debug!("Service discovery stopped");
        })
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wakeup.notify_one();
    }

    /// One discovery round. Errors are logged and retried after a short
    /// random delay. Returns how long to wait before the next round.
    pub async fn perform_service_discovery(&self) -> Duration {
        match self.refresh_if_necessary().await {
            Ok(wait) => wait,
            Err(e) => {
                let delay = retry_delay();
                tracing::error!(
                    "Service discovery failed, retrying in {:?}: {}",
                    delay,
                    e
                );
                delay
            }
        }
    }

    /// Resolve the replica set and replace the hosts if it changed.
    /// Returns how long to wait before the next round.
    pub async fn refresh_if_necessary(&self) -> Result<Duration> {
        let resolution = self.resolver.resolve().await?;
        let wait = self.new_wait_time_for(resolution.ttl);

        let mut from_dns = resolution.addresses;
        from_dns.sort();
        from_dns.dedup();

        let current = self.load_balancer.host_list().addresses();
        if from_dns != current {
            self.replace_hosts(from_dns).await?;
        }

        Ok(wait)
    }

    /// Swap in hosts for `addresses` and close the pools of hosts that are
    /// gone. Addresses that stay keep their existing host.
    pub async fn replace_hosts(&self, addresses: Vec<HostAddress>) -> Result<()> {
        let host_list = self.load_balancer.host_list();
        let limits = self.load_balancer.limits();
        let current = host_list.hosts();

        let hosts = addresses
            .iter()
            .map(|address| {
                match current.iter().find(|host| host.address() == address) {
                    Some(host) => Ok(Arc::clone(host)),
                    None => {
                        let db = self.connector.connect(address)?;
                        Ok(Arc::new(Host::new(address.clone(), db, limits)))
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            "Replacing replicas [{}] with [{}]",
            join_addresses(&host_list.addresses()),
            join_addresses(&addresses)
        );

        let old = host_list.replace(hosts);
        let removed: Vec<_> = old
            .iter()
            .filter(|host| !addresses.contains(host.address()))
            .collect();

        join_all(
            removed
                .iter()
                .map(|host| host.disconnect(self.disconnect_timeout)),
        )
        .await;

        if !removed.is_empty() {
            tracing::debug!("Disconnected {} removed replica(s)", removed.len());
        }
        Ok(())
    }

    /// Wait until the next round: the record's TTL, but never less than the
    /// configured interval
    pub fn new_wait_time_for(&self, ttl: Option<Duration>) -> Duration {
        ttl.map_or(self.interval, |ttl| ttl.max(self.interval))
    }
}

fn retry_delay() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(RETRY_DELAY_RANGE))
}

fn join_addresses(addresses: &[HostAddress]) -> String {
    addresses
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::balancer::{ReplicaLimits, RetryPolicy};
    use crate::database::mock::{MockConnector, MockDatabase};
    use crate::error::Error;

    /// Resolver returning whatever the test last set
    struct MockResolver {
        next: Mutex<Result<Resolution>>,
        lookups: Mutex<usize>,
    }

    impl MockResolver {
        fn new(names: &[&str], ttl: Option<u64>) -> Self {
            let resolver = Self {
                next: Mutex::new(Ok(Resolution::default())),
                lookups: Mutex::new(0),
            };
            resolver.answer(names, ttl);
            resolver
        }

        fn answer(&self, names: &[&str], ttl: Option<u64>) {
            let addresses = names.iter().map(|n| HostAddress::parse(n).unwrap()).collect();
            *self.next.lock().unwrap() = Ok(Resolution {
                addresses,
                ttl: ttl.map(Duration::from_secs),
            });
        }

        fn fail(&self) {
            *self.next.lock().unwrap() = Err(Error::Dns("SERVFAIL".into()));
        }
    }

    #[async_trait]
    impl Resolver for Arc<MockResolver> {
        async fn resolve(&self) -> Result<Resolution> {
            *self.lookups.lock().unwrap() += 1;
            match &*self.next.lock().unwrap() {
                Ok(resolution) => Ok(resolution.clone()),
                Err(e) => Err(Error::Dns(e.to_string())),
            }
        }
    }

    struct Fixture {
        discovery: Arc<ServiceDiscovery<MockConnector, Arc<MockResolver>>>,
        connector: Arc<MockConnector>,
        resolver: Arc<MockResolver>,
    }

    fn fixture(initial: &[&str]) -> Fixture {
        let connector = Arc::new(MockConnector::new());
        let hosts = initial
            .iter()
            .map(|name| {
                let address = HostAddress::parse(name).unwrap();
                let db = connector.connect(&address).unwrap();
                Arc::new(Host::new(address, db, ReplicaLimits::default()))
            })
            .collect();

        let lb = Arc::new(LoadBalancer::new(
            MockDatabase::primary("primary", Some("1")),
            hosts,
            ReplicaLimits::default(),
            RetryPolicy::default(),
        ));
        let resolver = Arc::new(MockResolver::new(initial, Some(30)));
        let discovery = Arc::new(ServiceDiscovery::new(
            Arc::clone(&connector),
            Arc::clone(&resolver),
            lb,
            Duration::from_secs(60),
            Duration::from_secs(120),
        ));

        Fixture {
            discovery,
            connector,
            resolver,
        }
    }

    fn current(f: &Fixture) -> Vec<String> {
        f.discovery
            .load_balancer()
            .host_list()
            .addresses()
            .iter()
            .map(|a| a.to_string())
            .collect()
    }

    #[test]
    fn test_new_wait_time_for() {
        let f = fixture(&[]);

        assert_eq!(f.discovery.new_wait_time_for(None), Duration::from_secs(60));
        assert_eq!(
            f.discovery.new_wait_time_for(Some(Duration::from_secs(30))),
            Duration::from_secs(60)
        );
        assert_eq!(
            f.discovery.new_wait_time_for(Some(Duration::from_secs(90))),
            Duration::from_secs(90)
        );
    }

    #[tokio::test]
    async fn test_unchanged_addresses_keep_hosts() {
        let f = fixture(&["10.0.0.1", "10.0.0.2"]);
        let before = f.discovery.load_balancer().host_list().hosts();

        // Same set, different order
        f.resolver.answer(&["10.0.0.2", "10.0.0.1"], Some(30));
        let wait = f.discovery.refresh_if_necessary().await.unwrap();

        let after = f.discovery.load_balancer().host_list().hosts();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(wait, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_churn_replaces_hosts() {
        let f = fixture(&["10.0.0.1", "10.0.0.2"]);
        let a = f.connector.database("10.0.0.1").unwrap();
        let b = f.connector.database("10.0.0.2").unwrap();
        b.set_in_use(1);

        f.resolver.answer(&["10.0.0.1", "10.0.0.3"], Some(90));
        let discovery = Arc::clone(&f.discovery);
        let refresh = tokio::spawn(async move { discovery.refresh_if_necessary().await });

        tokio::time::sleep(Duration::from_secs(10)).await;

        // New set is live while the removed host drains
        assert_eq!(current(&f), vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(b.disconnects(), 0);

        b.set_in_use(0);
        let wait = refresh.await.unwrap().unwrap();

        assert_eq!(wait, Duration::from_secs(90));
        assert_eq!(b.disconnects(), 1);
        assert_eq!(a.disconnects(), 0);
        assert!(f.connector.database("10.0.0.3").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_host_is_disconnected_after_timeout() {
        let f = fixture(&["10.0.0.1"]);
        let old = f.connector.database("10.0.0.1").unwrap();
        old.set_in_use(3);
        let started = tokio::time::Instant::now();

        f.resolver.answer(&["10.0.0.2"], None);
        f.discovery.refresh_if_necessary().await.unwrap();

        assert_eq!(old.disconnects(), 1);
        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_empty_answer_removes_every_replica() {
        let f = fixture(&["10.0.0.1"]);

        f.resolver.answer(&[], Some(30));
        f.discovery.refresh_if_necessary().await.unwrap();

        assert!(f.discovery.load_balancer().host_list().is_empty());
    }

    #[tokio::test]
    async fn test_failed_round_retries_soon() {
        let f = fixture(&["10.0.0.1"]);
        f.resolver.fail();

        let wait = f.discovery.perform_service_discovery().await;

        assert!(wait >= Duration::from_secs(1) && wait <= Duration::from_secs(5));
        assert_eq!(current(&f), vec!["10.0.0.1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let f = fixture(&["10.0.0.1"]);
        f.resolver.answer(&["10.0.0.2"], None);

        let handle = Arc::clone(&f.discovery).start().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(current(&f), vec!["10.0.0.2"]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*f.resolver.lookups.lock().unwrap(), 2);

        f.discovery.stop().await;
        handle.await.unwrap();
    }
}
