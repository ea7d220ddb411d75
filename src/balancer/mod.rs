//! Replica Load Balancing Module
//!
//! Host health tracking, round-robin replica selection, and the read /
//! read-write dispatch policy with retries and primary fallback.

mod host;
mod host_list;
mod load_balancer;
mod scope;

pub use host::{Host, ReplicaLimits};
pub use host_list::{HostList, HostSnapshot};
pub use load_balancer::{backoff_delay, LoadBalancer, RetryPolicy};
pub use scope::RequestScope;
