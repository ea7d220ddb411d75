//! Sticking Module
//!
//! Read-your-own-writes across units of work. After a write, the primary's
//! write location is stored under the writer's identity; later units of
//! work by the same identity stay on the primary until every replica has
//! replayed up to that location, or until the record expires.

mod store;

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use crate::balancer::{LoadBalancer, RequestScope};
use crate::database::{Database, WriteLocation};
use crate::error::Result;

pub use store::{open_store, KeyValueStore, MemoryStore, SqliteStore};

/// Prefix of every sticking key
const KEY_PREFIX: &str = "database-load-balancing/write-location";

/// Default lifetime of a sticking record
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(30);

pub struct Sticking<D> {
    load_balancer: Arc<LoadBalancer<D>>,
    store: Arc<dyn KeyValueStore>,
    expiration: Duration,
}

impl<D: Database> Sticking<D> {
    pub fn new(
        load_balancer: Arc<LoadBalancer<D>>,
        store: Arc<dyn KeyValueStore>,
        expiration: Duration,
    ) -> Self {
        Self {
            load_balancer,
            store,
            expiration,
        }
    }

    /// Store key for an identity
    pub fn key(namespace: &str, id: impl Display) -> String {
        format!("{}/{}/{}", KEY_PREFIX, namespace, id)
    }

    /// Record the primary's current write location for an identity
    pub async fn stick(&self, namespace: &str, id: impl Display) -> Result<()> {
        self.mark_primary_write_location(namespace, id).await
    }

    /// Stick only if the unit of work wrote. Returns whether it stuck.
    pub async fn stick_if_necessary(
        &self,
        scope: &RequestScope<D>,
        namespace: &str,
        id: impl Display,
    ) -> Result<bool> {
        if !scope.session().performed_write() {
            return Ok(false);
        }
        self.stick(namespace, id).await?;
        Ok(true)
    }

    /// Stick many identities to one lookup of the primary's location
    pub async fn bulk_stick<I, T>(&self, namespace: &str, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        let location = self.load_balancer.primary_write_location().await?;
        for id in ids {
            self.set_write_location_for(namespace, id, &location).await?;
        }
        Ok(())
    }

    pub async fn mark_primary_write_location(&self, namespace: &str, id: impl Display) -> Result<()> {
        let location = self.load_balancer.primary_write_location().await?;
        self.set_write_location_for(namespace, id, &location).await
    }

    pub async fn set_write_location_for(
        &self,
        namespace: &str,
        id: impl Display,
        location: &WriteLocation,
    ) -> Result<()> {
        let key = Self::key(namespace, id);
        self.store
            .set(&key, location.as_str(), self.expiration)
            .await
    }

    pub async fn last_write_location_for(
        &self,
        namespace: &str,
        id: impl Display,
    ) -> Result<Option<WriteLocation>> {
        let key = Self::key(namespace, id);
        Ok(self.store.get(&key).await?.map(WriteLocation::new))
    }

    pub async fn unstick(&self, namespace: &str, id: impl Display) -> Result<()> {
        let key = Self::key(namespace, id);
        self.store.del(&key).await
    }

    /// Whether every replica has caught up with the identity's last write.
    /// True when there is no record; a caught-up record is deleted.
    pub async fn all_caught_up(&self, namespace: &str, id: impl Display) -> Result<bool> {
        let key = Self::key(namespace, id);
        let location = match self.store.get(&key).await? {
            Some(location) => WriteLocation::new(location),
            None => return Ok(true),
        };

        if !self.load_balancer.all_caught_up(&location).await {
            return Ok(false);
        }

        // A newer write may have been stuck meanwhile. The store has no
        // compare-and-delete, so a stick landing between this check and
        // the delete can still be lost; the TTL bounds that window.
        match self.store.get(&key).await? {
            Some(current) if current != location.as_str() => Ok(false),
            Some(_) => {
                self.store.del(&key).await?;
                Ok(true)
            }
            None => Ok(true),
        }
    }

    /// Pin the unit of work to the primary while the identity's last write
    /// may still be missing on a replica
    pub async fn unstick_or_continue_sticking(
        &self,
        scope: &RequestScope<D>,
        namespace: &str,
        id: impl Display,
    ) -> Result<()> {
        if !self.all_caught_up(namespace, &id).await? {
            tracing::debug!(
                request_id = %scope.id(),
                "Replicas behind write of {}/{}, using primary",
                namespace,
                id
            );
            scope.session().force_primary();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{Host, ReplicaLimits, RetryPolicy};
    use crate::database::mock::MockDatabase;
    use crate::database::HostAddress;

    struct Fixture {
        sticking: Sticking<MockDatabase>,
        primary: MockDatabase,
        replicas: Vec<MockDatabase>,
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemoryStore::new()))
    }

    fn fixture_with_store(store: Arc<dyn KeyValueStore>) -> Fixture {
        let primary = MockDatabase::primary("primary", Some("100"));
        let replicas = vec![MockDatabase::replica("db-1"), MockDatabase::replica("db-2")];
        let hosts = replicas
            .iter()
            .map(|db| {
                Arc::new(Host::new(
                    HostAddress::parse(db.name()).unwrap(),
                    db.clone(),
                    ReplicaLimits::default(),
                ))
            })
            .collect();

        let lb = Arc::new(LoadBalancer::new(
            primary.clone(),
            hosts,
            ReplicaLimits::default(),
            RetryPolicy::default(),
        ));
        let sticking = Sticking::new(lb, store, DEFAULT_EXPIRATION);

        Fixture {
            sticking,
            primary,
            replicas,
        }
    }

    fn replay_all(fixture: &Fixture, position: u64) {
        for replica in &fixture.replicas {
            replica.set_replayed(position);
        }
    }

    #[test]
    fn test_key() {
        assert_eq!(
            Sticking::<MockDatabase>::key("user", 42),
            "database-load-balancing/write-location/user/42"
        );
    }

    #[tokio::test]
    async fn test_stick_records_primary_location() {
        let f = fixture();

        f.sticking.stick("user", 1).await.unwrap();

        assert_eq!(
            f.sticking.last_write_location_for("user", 1).await.unwrap(),
            Some(WriteLocation::new("100"))
        );
        assert_eq!(f.sticking.last_write_location_for("user", 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_all_caught_up_follows_replicas() {
        let f = fixture();
        f.sticking.stick("user", 1).await.unwrap();

        f.replicas[0].set_replayed(100);
        f.replicas[1].set_replayed(99);
        assert!(!f.sticking.all_caught_up("user", 1).await.unwrap());
        assert!(f.sticking.last_write_location_for("user", 1).await.unwrap().is_some());

        f.replicas[1].set_replayed(100);
        assert!(f.sticking.all_caught_up("user", 1).await.unwrap());
        assert_eq!(f.sticking.last_write_location_for("user", 1).await.unwrap(), None);
    }

    /// Stores `newer` right after the first read, as a concurrent stick
    /// by another unit of work would
    struct StickDuringCheck {
        inner: MemoryStore,
        newer: String,
        reads: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for StickDuringCheck {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let value = self.inner.get(key).await?;
            if self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                self.inner.set(key, &self.newer, DEFAULT_EXPIRATION).await?;
            }
            Ok(value)
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn del(&self, key: &str) -> Result<()> {
            self.inner.del(key).await
        }
    }

    #[tokio::test]
    async fn test_all_caught_up_keeps_newer_record() {
        let inner = MemoryStore::new();
        let key = Sticking::<MockDatabase>::key("user", 1);
        inner.set(&key, "100", DEFAULT_EXPIRATION).await.unwrap();
        let store = Arc::new(StickDuringCheck {
            inner,
            newer: "200".to_string(),
            reads: Default::default(),
        });
        let f = fixture_with_store(store);

        replay_all(&f, 100);
        assert!(!f.sticking.all_caught_up("user", 1).await.unwrap());
        assert_eq!(
            f.sticking.last_write_location_for("user", 1).await.unwrap(),
            Some(WriteLocation::new("200"))
        );
    }

    #[tokio::test]
    async fn test_all_caught_up_without_record() {
        let f = fixture();
        assert!(f.sticking.all_caught_up("user", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_after_write_scenario() {
        let f = fixture();

        // Unit of work 1 writes while the primary is at 100
        let writer = RequestScope::new();
        writer.session().mark_write();
        assert!(f.sticking.stick_if_necessary(&writer, "user", 1).await.unwrap());

        // Unit of work 2 starts while replicas are at 90
        replay_all(&f, 90);
        let reader = RequestScope::new();
        f.sticking
            .unstick_or_continue_sticking(&reader, "user", 1)
            .await
            .unwrap();
        assert!(reader.session().using_primary());

        // Unit of work 3 starts after replicas reached 100
        replay_all(&f, 100);
        let later = RequestScope::new();
        f.sticking
            .unstick_or_continue_sticking(&later, "user", 1)
            .await
            .unwrap();
        assert!(!later.session().using_primary());
        assert_eq!(f.sticking.last_write_location_for("user", 1).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_releases_pin() {
        let f = fixture();
        replay_all(&f, 0);

        f.sticking.stick("user", 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(f.sticking.last_write_location_for("user", 1).await.unwrap(), None);

        let scope = RequestScope::new();
        f.sticking
            .unstick_or_continue_sticking(&scope, "user", 1)
            .await
            .unwrap();
        assert!(!scope.session().using_primary());
    }

    #[tokio::test]
    async fn test_stick_if_necessary_without_write() {
        let f = fixture();
        let scope = RequestScope::new();

        assert!(!f.sticking.stick_if_necessary(&scope, "user", 1).await.unwrap());
        assert_eq!(f.sticking.last_write_location_for("user", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bulk_stick() {
        let f = fixture();

        f.sticking.bulk_stick("runner", [1, 2, 3]).await.unwrap();
        for id in 1..=3 {
            assert_eq!(
                f.sticking.last_write_location_for("runner", id).await.unwrap(),
                Some(WriteLocation::new("100"))
            );
        }
    }

    #[tokio::test]
    async fn test_unstick() {
        let f = fixture();

        f.sticking.stick("user", 1).await.unwrap();
        f.sticking.unstick("user", 1).await.unwrap();
        assert_eq!(f.sticking.last_write_location_for("user", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stick_fails_without_primary_location() {
        let f = fixture();
        f.primary.set_write_location(None);

        assert!(f.sticking.stick("user", 1).await.is_err());
    }
}
