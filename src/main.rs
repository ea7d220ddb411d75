//! WolfBalance - MariaDB Replica Load Balancer
//!
//! Command line tool for checking a load balancing configuration and
//! watching replica health.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfbalance::balancer::{Host, LoadBalancer, ReplicaLimits};
use wolfbalance::config::WolfBalanceConfig;
use wolfbalance::database::{Database, MariaDb, MariaDbConnector, WriteLocation};
use wolfbalance::discovery::{DnsResolver, Resolver, ServiceDiscovery};

/// WolfBalance - MariaDB Replica Load Balancer
#[derive(Parser)]
#[command(name = "wolfbalance")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfbalance.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the
    /// configured level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfbalance.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,

    /// Probe the primary and every replica
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Resolve the discovery record once
    Discover,

    /// Keep discovering replicas and report their health until Ctrl+C
    Run {
        /// Seconds between health reports
        #[arg(long, default_value_t = 30)]
        report_interval: u64,
    },
}

#[derive(Debug, Serialize)]
struct StatusReport {
    primary: String,
    write_location: Option<String>,
    replicas: Vec<ReplicaStatus>,
}

#[derive(Debug, Serialize)]
struct ReplicaStatus {
    address: String,
    online: bool,
    lag_seconds: Option<f64>,
    lag_bytes: Option<u64>,
    caught_up: Option<bool>,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| {
            WolfBalanceConfig::from_file(&cli.config)
                .ok()
                .map(|c| c.logging.level)
        })
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Init { output, force } => run_init(output, force),
        Commands::Validate => run_validate(cli.config),
        Commands::Status { json } => run_status(cli.config, json).await,
        Commands::Discover => run_discover(cli.config).await,
        Commands::Run { report_interval } => {
            run_service(cli.config, Duration::from_secs(report_interval.max(1))).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &PathBuf) -> anyhow::Result<WolfBalanceConfig> {
    WolfBalanceConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Balancer with the static replicas, refreshed once from DNS when
/// discovery is configured
async fn build_balancer(
    config: &WolfBalanceConfig,
) -> anyhow::Result<Arc<LoadBalancer<MariaDb>>> {
    let connector = Arc::new(MariaDbConnector::new(config.primary.clone()));
    let lb = Arc::new(LoadBalancer::from_config(connector.as_ref(), config)?);

    if config.service_discovery_enabled() {
        let discovery = ServiceDiscovery::from_config(
            Arc::clone(&connector),
            Arc::clone(&lb),
            &config.load_balancing.discover,
        )?;
        discovery
            .refresh_if_necessary()
            .await
            .context("service discovery failed")?;
    }

    Ok(lb)
}

/// Initialize configuration file
fn run_init(output: PathBuf, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!("{} already exists, use --force to overwrite", output.display());
    }

    let config_content = r#"# WolfBalance Configuration
# Generated configuration file

[primary]
host = "localhost"
port = 3306
user = "app"
password = "changeme"
database = "app"
pool_size = 10
connect_timeout_secs = 30

[load_balancing]
hosts = []
# hosts = ["db-replica-1", "db-replica-2:3307"]
max_replication_difference = 8388608
max_replication_lag_time = 60
replica_check_interval = 60

[load_balancing.discover]
nameserver = "localhost"
port = 8600
# record = "db-replica.service.consul"
record_type = "A"
interval = 60
disconnect_timeout = 120
use_tcp = false

[sticking]
expiration_secs = 30
store = "memory"
# store = "sqlite"
# path = "/var/lib/wolfbalance/sticking.db"

[logging]
level = "info"
"#;

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfBalanceConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!(
                "  Primary: {}@{}",
                config.primary.user,
                config.primary_address()
            );
            println!("  Static replicas: {}", config.load_balancing.hosts.len());
            match &config.load_balancing.discover.record {
                Some(record) => println!(
                    "  Discovery: {} {} via {}:{}",
                    config.load_balancing.discover.record_type,
                    record,
                    config.load_balancing.discover.nameserver,
                    config.load_balancing.discover.port
                ),
                None => println!("  Discovery: disabled"),
            }
            println!(
                "  Load balancing: {}",
                if config.load_balancing_enabled() { "enabled" } else { "disabled" }
            );
            println!("  Sticking store: {}", config.sticking.store);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Judged from the lag just probed, not from the host's cached state
fn replica_online(status: &ReplicaStatus, limits: &ReplicaLimits) -> bool {
    status.error.is_none() && limits.accepts(status.lag_seconds, status.lag_bytes)
}

async fn replica_status(
    host: &Host<MariaDb>,
    limits: &ReplicaLimits,
    location: Option<&WriteLocation>,
) -> ReplicaStatus {
    let db = host.database();
    let mut status = ReplicaStatus {
        address: host.address().to_string(),
        online: false,
        lag_seconds: None,
        lag_bytes: None,
        caught_up: None,
        error: None,
    };

    let probe = async {
        status.lag_seconds = db.replication_lag_time().await?;
        status.lag_bytes = db.replication_lag_size().await?;
        if let Some(location) = location {
            status.caught_up = Some(db.caught_up_to(location).await?);
        }
        Ok::<_, wolfbalance::Error>(())
    };

    if let Err(e) = probe.await {
        status.error = Some(e.to_string());
    }
    status.online = replica_online(&status, limits);
    db.release_connections();
    status
}

async fn collect_status(lb: &LoadBalancer<MariaDb>) -> StatusReport {
    let write_location = match lb.primary_write_location().await {
        Ok(location) => Some(location),
        Err(e) => {
            tracing::warn!("Could not read primary write location: {}", e);
            None
        }
    };

    let limits = lb.limits();
    let hosts = lb.host_list().hosts();
    let replicas = futures::future::join_all(
        hosts
            .iter()
            .map(|host| replica_status(host, &limits, write_location.as_ref())),
    )
    .await;

    StatusReport {
        primary: lb.primary().address().to_string(),
        write_location: write_location.map(|l| l.to_string()),
        replicas,
    }
}

/// Probe the primary and every replica
async fn run_status(config_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let lb = build_balancer(&config).await?;
    let report = collect_status(&lb).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("WolfBalance Status");
    println!("==================");
    println!();
    println!("Primary:          {}", report.primary);
    println!(
        "Write Location:   {}",
        report.write_location.as_deref().unwrap_or("(unknown)")
    );
    println!();

    if report.replicas.is_empty() {
        println!("No replicas configured; all queries use the primary.");
        return Ok(());
    }

    println!(
        "{:<28} {:<8} {:>10} {:>12} {:>10}",
        "REPLICA", "ONLINE", "LAG (s)", "LAG (bytes)", "CAUGHT UP"
    );
    for replica in &report.replicas {
        println!(
            "{:<28} {:<8} {:>10} {:>12} {:>10}",
            replica.address,
            if replica.online { "yes" } else { "no" },
            replica
                .lag_seconds
                .map(|s| format!("{:.1}", s))
                .unwrap_or_else(|| "-".into()),
            replica
                .lag_bytes
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".into()),
            match replica.caught_up {
                Some(true) => "yes",
                Some(false) => "no",
                None => "-",
            }
        );
        if let Some(error) = &replica.error {
            println!("  error: {}", error);
        }
    }

    Ok(())
}

/// Resolve the discovery record once
async fn run_discover(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    if !config.service_discovery_enabled() {
        bail!("load_balancing.discover.record is not set");
    }

    let resolver = DnsResolver::from_config(&config.load_balancing.discover)?;
    let resolution = resolver.resolve().await?;

    match resolution.ttl {
        Some(ttl) => println!("TTL: {}s", ttl.as_secs()),
        None => println!("TTL: (none)"),
    }
    if resolution.addresses.is_empty() {
        println!("No addresses found");
    }
    for address in &resolution.addresses {
        println!("{}", address);
    }

    Ok(())
}

/// Run service discovery and report replica health until Ctrl+C
async fn run_service(config_path: PathBuf, report_interval: Duration) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    if !config.load_balancing_enabled() {
        tracing::warn!("No replicas or discovery record configured; all queries use the primary");
    }

    let connector = Arc::new(MariaDbConnector::new(config.primary.clone()));
    let lb = Arc::new(LoadBalancer::from_config(connector.as_ref(), &config)?);

    let discovery = if config.service_discovery_enabled() {
        let discovery = Arc::new(ServiceDiscovery::from_config(
            Arc::clone(&connector),
            Arc::clone(&lb),
            &config.load_balancing.discover,
        )?);
        let handle = Arc::clone(&discovery).start().await;
        tracing::info!("Service discovery started");
        Some((discovery, handle))
    } else {
        None
    };

    let mut ticker = tokio::time::interval(report_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = collect_status(&lb).await;
                let online = report.replicas.iter().filter(|r| r.online).count();
                tracing::info!(
                    write_location = report.write_location.as_deref().unwrap_or("-"),
                    "{}/{} replica(s) online",
                    online,
                    report.replicas.len()
                );
                for replica in report.replicas.iter().filter(|r| !r.online) {
                    tracing::warn!(
                        "Replica {} is offline{}",
                        replica.address,
                        replica.error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Some((discovery, handle)) = discovery {
        discovery.stop().await;
        if let Err(e) = handle.await {
            tracing::warn!("Service discovery task ended abnormally: {}", e);
        }
    }

    for host in lb.host_list().hosts().iter() {
        host.database().disconnect().await;
    }
    lb.primary().disconnect().await;

    tracing::info!("WolfBalance stopped");
    Ok(())
}
