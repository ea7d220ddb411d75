//! Mock database for tests
//!
//! Positions are plain integers rendered as strings, so "caught up to 100"
//! means the replayed position is at least 100.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Connector, Database, HostAddress, WriteLocation};
use crate::error::{Error, Result};

#[derive(Debug)]
struct MockState {
    lag_time: Option<f64>,
    lag_size: Option<u64>,
    replayed: u64,
    is_primary: bool,
    write_location: Option<String>,
    fail_probes: bool,
    in_use: usize,
    disconnects: usize,
    probes: usize,
    releases: usize,
}

/// Scriptable in-memory stand-in for a connection pool
#[derive(Debug, Clone)]
pub struct MockDatabase {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockDatabase {
    /// A healthy replica at position 0
    pub fn replica(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MockState {
                lag_time: Some(0.0),
                lag_size: Some(0),
                replayed: 0,
                is_primary: false,
                write_location: None,
                fail_probes: false,
                in_use: 0,
                disconnects: 0,
                probes: 0,
                releases: 0,
            })),
        }
    }

    /// A primary reporting `location` as its write location
    pub fn primary(name: &str, location: Option<&str>) -> Self {
        let db = Self::replica(name);
        {
            let mut state = db.state();
            state.is_primary = true;
            state.write_location = location.map(str::to_string);
        }
        db
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_lag(&self, lag_time: Option<f64>, lag_size: Option<u64>) {
        let mut state = self.state();
        state.lag_time = lag_time;
        state.lag_size = lag_size;
    }

    pub fn set_replayed(&self, position: u64) {
        self.state().replayed = position;
    }

    pub fn set_write_location(&self, location: Option<&str>) {
        self.state().write_location = location.map(str::to_string);
    }

    pub fn set_fail_probes(&self, fail: bool) {
        self.state().fail_probes = fail;
    }

    pub fn set_in_use(&self, in_use: usize) {
        self.state().in_use = in_use;
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn probes(&self) -> usize {
        self.state().probes
    }

    pub fn releases(&self) -> usize {
        self.state().releases
    }

    fn probe(&self) -> Result<()> {
        let mut state = self.state();
        state.probes += 1;
        if state.fail_probes {
            return Err(Error::ConnectionFailed {
                address: self.name.clone(),
                reason: "probe failed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn replication_lag_time(&self) -> Result<Option<f64>> {
        self.probe()?;
        Ok(self.state().lag_time)
    }

    async fn replication_lag_size(&self) -> Result<Option<u64>> {
        self.probe()?;
        Ok(self.state().lag_size)
    }

    async fn caught_up_to(&self, location: &WriteLocation) -> Result<bool> {
        self.probe()?;
        let state = self.state();
        if state.is_primary {
            return Ok(true);
        }
        let wanted: u64 = location
            .as_str()
            .parse()
            .map_err(|_| Error::QueryExecution(format!("bad position {}", location)))?;
        Ok(state.replayed >= wanted)
    }

    async fn write_location(&self) -> Result<Option<WriteLocation>> {
        self.probe()?;
        Ok(self.state().write_location.clone().map(WriteLocation::new))
    }

    fn release_connections(&self) {
        self.state().releases += 1;
    }

    fn connections_in_use(&self) -> usize {
        self.state().in_use
    }

    async fn disconnect(&self) {
        let mut state = self.state();
        state.disconnects += 1;
        state.in_use = 0;
    }
}

/// Connector handing out mock replicas and remembering them by address
#[derive(Debug, Default)]
pub struct MockConnector {
    created: Mutex<HashMap<HostAddress, MockDatabase>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mock built for `address`, if any
    pub fn database(&self, address: &str) -> Option<MockDatabase> {
        let address = HostAddress::parse(address).ok()?;
        self.created.lock().unwrap().get(&address).cloned()
    }
}

impl Connector for MockConnector {
    type Database = MockDatabase;

    fn connect(&self, address: &HostAddress) -> Result<MockDatabase> {
        let db = MockDatabase::replica(&address.to_string());
        self.created
            .lock()
            .unwrap()
            .insert(address.clone(), db.clone());
        Ok(db)
    }
}
