//! DNS Resolver
//!
//! Looks up the discovery record against the configured nameserver with
//! hickory. A records give bare hosts, SRV records give host and port.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::{self, RData, Record};
use hickory_resolver::TokioAsyncResolver;

use super::{Resolution, Resolver};
use crate::config::DiscoverConfig;
use crate::database::HostAddress;
use crate::error::{Error, Result};

/// How long to wait for the nameserver
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Record types usable for discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Srv,
}

impl RecordType {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "SRV" => Ok(RecordType::Srv),
            other => Err(Error::Config(format!("unsupported record type: {}", other))),
        }
    }

    fn query_type(self) -> rr::RecordType {
        match self {
            RecordType::A => rr::RecordType::A,
            RecordType::Srv => rr::RecordType::SRV,
        }
    }
}

/// Resolves one record against one nameserver
#[derive(Debug, Clone)]
pub struct DnsResolver {
    nameserver: String,
    port: u16,
    record: String,
    record_type: RecordType,
    use_tcp: bool,
}

impl DnsResolver {
    pub fn new(nameserver: String, port: u16, record: String, record_type: RecordType, use_tcp: bool) -> Self {
        Self {
            nameserver,
            port,
            record,
            record_type,
            use_tcp,
        }
    }

    pub fn from_config(config: &DiscoverConfig) -> Result<Self> {
        let record = config
            .record
            .clone()
            .ok_or_else(|| Error::Config("load_balancing.discover.record is not set".into()))?;

        Ok(Self::new(
            config.nameserver.clone(),
            config.port,
            record,
            RecordType::parse(&config.record_type)?,
            config.use_tcp,
        ))
    }

    async fn nameserver_address(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.nameserver.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| Error::Dns(format!("cannot resolve nameserver {}", self.nameserver)))
    }

    /// Resolver that only asks `server`. Truncated UDP answers are retried
    /// over TCP; `use_tcp` skips UDP entirely.
    fn resolver_for(&self, server: SocketAddr) -> TokioAsyncResolver {
        let mut config = ResolverConfig::new();
        if !self.use_tcp {
            config.add_name_server(NameServerConfig::new(server, Protocol::Udp));
        }
        config.add_name_server(NameServerConfig::new(server, Protocol::Tcp));

        let mut opts = ResolverOpts::default();
        opts.timeout = QUERY_TIMEOUT;
        opts.attempts = 1;
        // Every refresh must reach the nameserver
        opts.cache_size = 0;

        TokioAsyncResolver::tokio(config, opts)
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self) -> Result<Resolution> {
        let server = self.nameserver_address().await?;
        let resolver = self.resolver_for(server);

        match resolver
            .lookup(self.record.as_str(), self.record_type.query_type())
            .await
        {
            Ok(lookup) => Ok(resolution_from_records(self.record_type, lookup.records())),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => {
                    tracing::debug!("No {:?} records for {}", self.record_type, self.record);
                    Ok(Resolution {
                        addresses: Vec::new(),
                        ttl: None,
                    })
                }
                _ => Err(Error::Dns(format!("lookup of {} failed: {}", self.record, e))),
            },
        }
    }
}

/// Addresses in `records`, sorted and without duplicates. The TTL is the
/// first answer's. SRV targets are replaced by their address when the
/// nameserver sent one along.
fn resolution_from_records(record_type: RecordType, records: &[Record]) -> Resolution {
    let answers: Vec<&Record> = records
        .iter()
        .filter(|r| r.record_type() == record_type.query_type())
        .collect();

    let ttl = answers.first().map(|r| Duration::from_secs(r.ttl() as u64));

    let mut addresses: Vec<HostAddress> = answers
        .iter()
        .filter_map(|r| match r.data()? {
            RData::A(a) => Some(HostAddress::new(a.0.to_string(), None)),
            RData::SRV(srv) => {
                let host = address_for(records, srv.target())
                    .unwrap_or_else(|| host_name(srv.target()));
                Some(HostAddress::new(host, Some(srv.port())))
            }
            _ => None,
        })
        .collect();

    addresses.sort();
    addresses.dedup();
    Resolution { addresses, ttl }
}

fn address_for(records: &[Record], target: &rr::Name) -> Option<String> {
    records.iter().find_map(|r| match r.data()? {
        RData::A(a) if r.name() == target => Some(a.0.to_string()),
        _ => None,
    })
}

fn host_name(name: &rr::Name) -> String {
    name.to_utf8().trim_end_matches('.').to_string()
}
