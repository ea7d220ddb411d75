//! Host List
//!
//! Round-robin registry of replicas. Readers work on an immutable snapshot;
//! replacing the hosts swaps the snapshot atomically, so a lookup sees
//! either the old or the new list and never a mix.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;

use super::host::Host;
use crate::database::{Database, HostAddress};

/// Shared, atomically replaceable list of hosts
pub type HostSnapshot<D> = Arc<Vec<Arc<Host<D>>>>;

pub struct HostList<D> {
    hosts: ArcSwap<Vec<Arc<Host<D>>>>,
    /// Position of the next host to hand out
    index: AtomicUsize,
}

impl<D: Database> HostList<D> {
    /// Create a list; hosts are shuffled so processes don't all start
    /// on the same replica
    pub fn new(hosts: Vec<Arc<Host<D>>>) -> Self {
        Self {
            hosts: ArcSwap::from_pointee(shuffled(hosts)),
            index: AtomicUsize::new(0),
        }
    }

    /// Current snapshot of all hosts
    pub fn hosts(&self) -> HostSnapshot<D> {
        self.hosts.load_full()
    }

    /// Replace every host, returning the previous snapshot
    pub fn replace(&self, hosts: Vec<Arc<Host<D>>>) -> HostSnapshot<D> {
        let old = self.hosts.swap(Arc::new(shuffled(hosts)));
        self.index.store(0, Ordering::SeqCst);
        old
    }

    pub fn len(&self) -> usize {
        self.hosts.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.load().is_empty()
    }

    /// Sorted addresses of the current hosts
    pub fn addresses(&self) -> Vec<HostAddress> {
        let mut addresses: Vec<HostAddress> =
            self.hosts.load().iter().map(|h| h.address().clone()).collect();
        addresses.sort();
        addresses
    }

    /// Whether `database` is the pool of one of the current hosts
    pub fn manages(&self, database: &Arc<D>) -> bool {
        self.hosts
            .load()
            .iter()
            .any(|h| Arc::ptr_eq(h.database(), database))
    }

    /// Next online host in round-robin order. Returns `None` once a full
    /// cycle found no online host.
    pub async fn next(&self) -> Option<Arc<Host<D>>> {
        let hosts = self.hosts();
        if hosts.is_empty() {
            return None;
        }

        for _ in 0..hosts.len() {
            let index = self.index.fetch_add(1, Ordering::SeqCst) % hosts.len();
            let host = &hosts[index];
            if host.online().await {
                return Some(Arc::clone(host));
            }
        }

        None
    }
}

fn shuffled<T>(mut items: Vec<T>) -> Vec<T> {
    items.shuffle(&mut rand::thread_rng());
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::balancer::host::ReplicaLimits;
    use crate::database::mock::MockDatabase;

    fn make_host(name: &str) -> Arc<Host<MockDatabase>> {
        Arc::new(Host::new(
            HostAddress::parse(name).unwrap(),
            MockDatabase::replica(name),
            ReplicaLimits::default(),
        ))
    }

    fn make_list(names: &[&str]) -> HostList<MockDatabase> {
        HostList::new(names.iter().map(|n| make_host(n)).collect())
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let list = make_list(&["db-1", "db-2", "db-3"]);
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..30 {
            let host = list.next().await.unwrap();
            *counts.entry(host.address().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 10));
    }

    #[tokio::test]
    async fn test_next_skips_offline_hosts() {
        let list = make_list(&["db-1", "db-2", "db-3"]);
        for host in list.hosts().iter() {
            if host.address().host == "db-2" {
                host.offline().await;
            }
        }

        for _ in 0..6 {
            let host = list.next().await.unwrap();
            assert_ne!(host.address().host, "db-2");
        }
    }

    #[tokio::test]
    async fn test_next_returns_none_when_all_offline() {
        let list = make_list(&["db-1", "db-2"]);
        for host in list.hosts().iter() {
            host.offline().await;
        }

        assert!(list.next().await.is_none());
        assert!(list.next().await.is_none());
    }

    #[tokio::test]
    async fn test_next_on_empty_list() {
        let list: HostList<MockDatabase> = HostList::new(Vec::new());
        assert!(list.is_empty());
        assert!(list.next().await.is_none());
    }

    #[tokio::test]
    async fn test_replace_swaps_every_host() {
        let list = make_list(&["db-a", "db-b"]);
        let old = list.replace(vec![make_host("db-a"), make_host("db-c")]);

        assert_eq!(old.len(), 2);
        let names: Vec<String> = list.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(names, vec!["db-a", "db-c"]);

        // The old snapshot is untouched for readers still holding it
        let mut old_names: Vec<String> = old.iter().map(|h| h.address().to_string()).collect();
        old_names.sort();
        assert_eq!(old_names, vec!["db-a", "db-b"]);
    }

    #[tokio::test]
    async fn test_manages() {
        let list = make_list(&["db-1"]);
        let host = list.hosts()[0].clone();
        assert!(list.manages(host.database()));

        let stranger = Arc::new(MockDatabase::replica("db-9"));
        assert!(!list.manages(&stranger));
    }
}
