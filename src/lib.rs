//! WolfBalance - MariaDB Replica Load Balancer
//!
//! Spreads read queries over a set of MariaDB replicas while keeping each
//! unit of work consistent with its own writes.
//!
//! # Architecture
//!
//! A [`ConnectionProxy`](proxy::ConnectionProxy) classifies every call and
//! hands it to the [`LoadBalancer`](balancer::LoadBalancer), which sends
//! writes to the primary and reads to a healthy replica picked round-robin
//! from the [`HostList`](balancer::HostList). A per-request
//! [`Session`](session::Session) pins the unit of work to the primary after
//! it writes, until the replicas have replayed that write.
//!
//! # Features
//!
//! - Replica health checks on replication lag (time and bytes)
//! - Retry on replication conflicts, failover of dead replicas, primary fallback
//! - Exponential backoff for primary connection errors
//! - Read-your-own-writes across requests through [`Sticking`](sticking::Sticking)
//! - Replica discovery through DNS A or SRV records

pub mod balancer;
pub mod config;
pub mod database;
pub mod discovery;
pub mod error;
pub mod proxy;
pub mod session;
pub mod sticking;

pub use config::WolfBalanceConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::balancer::{LoadBalancer, RequestScope};
    pub use crate::config::WolfBalanceConfig;
    pub use crate::database::{Database, DbRole, MariaDb, MariaDbConnector, WriteLocation};
    pub use crate::discovery::ServiceDiscovery;
    pub use crate::error::{Error, Result};
    pub use crate::proxy::{ConnectionProxy, Operation};
    pub use crate::session::Session;
    pub use crate::sticking::Sticking;
}
