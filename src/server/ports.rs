//! Port allocation for clustered execution.
//!
//! When a pipeline is split across hosts, every remote hop between two step
//! copies needs a TCP port on the receiving host. The allocator hands out
//! ports from a configured range and remembers which hop owns each one, so a
//! finished run can give all of its ports back at once.

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Identity of one remote hop within one clustered run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortAllocationKey {
    pub host: String,
    pub clustered_run_id: String,
    pub pipeline_name: String,
    pub source_slave: String,
    pub source_step: String,
    pub source_copy: u32,
    pub target_slave: String,
    pub target_step: String,
    pub target_copy: u32,
}

impl PortAllocationKey {
    pub fn new(
        host: impl Into<String>,
        clustered_run_id: impl Into<String>,
        pipeline_name: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            clustered_run_id: clustered_run_id.into(),
            pipeline_name: pipeline_name.into(),
            source_slave: String::new(),
            source_step: String::new(),
            source_copy: 0,
            target_slave: String::new(),
            target_step: String::new(),
            target_copy: 0,
        }
    }

    pub fn source(mut self, slave: impl Into<String>, step: impl Into<String>, copy: u32) -> Self {
        self.source_slave = slave.into();
        self.source_step = step.into();
        self.source_copy = copy;
        self
    }

    pub fn target(mut self, slave: impl Into<String>, step: impl Into<String>, copy: u32) -> Self {
        self.target_slave = slave.into();
        self.target_step = step.into();
        self.target_copy = copy;
        self
    }

    pub fn run_identifier(&self) -> RunIdentifier {
        RunIdentifier::new(self.clustered_run_id.clone(), self.pipeline_name.clone())
    }

    fn belongs_to(&self, run: &RunIdentifier) -> bool {
        self.clustered_run_id == run.clustered_run_id && self.pipeline_name == run.pipeline_name
    }
}

impl fmt::Display for PortAllocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}/{}] {}:{}.{} -> {}:{}.{}",
            self.host,
            self.clustered_run_id,
            self.pipeline_name,
            self.source_slave,
            self.source_step,
            self.source_copy,
            self.target_slave,
            self.target_step,
            self.target_copy
        )
    }
}

/// The fields shared by every hop of one clustered run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentifier {
    pub clustered_run_id: String,
    pub pipeline_name: String,
}

impl RunIdentifier {
    pub fn new(clustered_run_id: impl Into<String>, pipeline_name: impl Into<String>) -> Self {
        Self {
            clustered_run_id: clustered_run_id.into(),
            pipeline_name: pipeline_name.into(),
        }
    }
}

#[derive(Default)]
struct Table {
    by_key: HashMap<PortAllocationKey, u16>,
    /// host -> port -> owner
    by_host: HashMap<String, BTreeMap<u16, PortAllocationKey>>,
}

impl Table {
    fn release(&mut self, host: &str, port: u16) -> Option<PortAllocationKey> {
        let ports = self.by_host.get_mut(host)?;
        let key = ports.remove(&port)?;
        if ports.is_empty() {
            self.by_host.remove(host);
        }
        self.by_key.remove(&key);
        Some(key)
    }
}

/// Server-wide table of allocated ports.
///
/// Both indexes live under one mutex, so a key and its `(host, port)` pair
/// are always added and removed together.
pub struct PortAllocator {
    range_size: u16,
    table: Mutex<Table>,
}

impl PortAllocator {
    /// # Panics
    ///
    /// Panics if `range_size` is 0.
    pub fn new(range_size: u16) -> Self {
        assert!(range_size > 0, "port range size must be at least 1");
        Self {
            range_size,
            table: Mutex::new(Table::default()),
        }
    }

    pub fn range_size(&self) -> u16 {
        self.range_size
    }

    /// Port for `key`, allocating the lowest free one at or above
    /// `range_start` if the key has none yet.
    ///
    /// # Panics
    ///
    /// Panics if the key has an empty host.
    pub fn allocate(&self, key: &PortAllocationKey, range_start: u16) -> Result<u16> {
        assert!(!key.host.is_empty(), "port allocation key needs a host");

        let mut table = self.table.lock();
        if let Some(&port) = table.by_key.get(key) {
            return Ok(port);
        }

        let free = {
            let taken = table.by_host.get(&key.host);
            (0..self.range_size)
                .map_while(|offset| range_start.checked_add(offset))
                .find(|port| taken.map_or(true, |ports| !ports.contains_key(port)))
        };

        match free {
            Some(port) => {
                table.by_key.insert(key.clone(), port);
                table
                    .by_host
                    .entry(key.host.clone())
                    .or_default()
                    .insert(port, key.clone());
                tracing::debug!("Allocated port {} for {}", port, key);
                Ok(port)
            }
            None => {
                drop(table);
                tracing::warn!(
                    "No free port on {} in [{}, +{})",
                    key.host,
                    range_start,
                    self.range_size
                );
                Err(EngineError::PortRangeExhausted {
                    host: key.host.clone(),
                    start: range_start,
                    size: self.range_size,
                })
            }
        }
    }

    /// Release the port owned on `host`. Unknown pairs are a no-op.
    pub fn deallocate(&self, port: u16, host: &str) -> Option<PortAllocationKey> {
        let released = self.table.lock().release(host, port);
        if let Some(key) = &released {
            tracing::debug!("Released port {} held by {}", port, key);
        }
        released
    }

    /// Release the port held by `key`, if any.
    pub fn deallocate_key(&self, key: &PortAllocationKey) -> Option<u16> {
        let mut table = self.table.lock();
        let port = *table.by_key.get(key)?;
        table.release(&key.host, port);
        Some(port)
    }

    /// Release every port belonging to `run`, on any host.
    pub fn deallocate_all(&self, run: &RunIdentifier) -> usize {
        let mut table = self.table.lock();
        let doomed: Vec<(String, u16)> = table
            .by_key
            .iter()
            .filter(|&(key, _)| key.belongs_to(run))
            .map(|(key, &port)| (key.host.clone(), port))
            .collect();
        for (host, port) in &doomed {
            table.release(host, *port);
        }
        drop(table);

        if !doomed.is_empty() {
            tracing::debug!(
                "Released {} port(s) of run {}/{}",
                doomed.len(),
                run.clustered_run_id,
                run.pipeline_name
            );
        }
        doomed.len()
    }

    pub fn port_of(&self, key: &PortAllocationKey) -> Option<u16> {
        self.table.lock().by_key.get(key).copied()
    }

    /// Snapshot of all allocations, sorted by host then port.
    pub fn allocations(&self) -> Vec<(PortAllocationKey, u16)> {
        let table = self.table.lock();
        let mut hosts: Vec<_> = table.by_host.iter().collect();
        hosts.sort_unstable_by(|a, b| a.0.cmp(b.0));
        hosts
            .into_iter()
            .flat_map(|(_, ports)| ports.iter().map(|(&port, key)| (key.clone(), port)))
            .collect()
    }

    /// Snapshot of the ports owned on `host`, ascending.
    pub fn allocations_for_host(&self, host: &str) -> Vec<(u16, PortAllocationKey)> {
        self.table
            .lock()
            .by_host
            .get(host)
            .map(|ports| ports.iter().map(|(&port, key)| (port, key.clone())).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.table.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range_size", &self.range_size)
            .field("allocated", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn hop(host: &str, run: &str, target_copy: u32) -> PortAllocationKey {
        PortAllocationKey::new(host, run, "load-sales")
            .source("master", "Read", 0)
            .target("slave-1", "Write", target_copy)
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let ports = PortAllocator::new(10);
        let key = hop("h1", "run-1", 0);
        assert_eq!(ports.allocate(&key, 40000).unwrap(), 40000);
        assert_eq!(ports.allocate(&key, 40000).unwrap(), 40000);
        assert_eq!(ports.len(), 1);
    }

    #[test]
    fn test_ports_are_per_host() {
        let ports = PortAllocator::new(10);
        assert_eq!(ports.allocate(&hop("h1", "r", 0), 40000).unwrap(), 40000);
        assert_eq!(ports.allocate(&hop("h2", "r", 0), 40000).unwrap(), 40000);
        assert_eq!(ports.allocate(&hop("h1", "r", 1), 40000).unwrap(), 40001);
    }

    #[test]
    fn test_run_id_makes_keys_distinct() {
        let ports = PortAllocator::new(10);
        let a = ports.allocate(&hop("h1", "run-1", 0), 40000).unwrap();
        let b = ports.allocate(&hop("h1", "run-2", 0), 40000).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_deallocate_makes_port_reusable() {
        let ports = PortAllocator::new(10);
        let first = hop("h1", "r", 0);
        ports.allocate(&first, 40000).unwrap();
        ports.allocate(&hop("h1", "r", 1), 40000).unwrap();

        assert_eq!(ports.deallocate(40000, "h1"), Some(first));
        assert_eq!(ports.deallocate(40000, "h1"), None);
        assert_eq!(ports.deallocate(40000, "nowhere"), None);
        assert_eq!(ports.allocate(&hop("h1", "r", 7), 40000).unwrap(), 40000);
    }

    #[test]
    fn test_deallocate_all_for_run() {
        let ports = PortAllocator::new(100);
        for copy in 0..5 {
            ports.allocate(&hop("h1", "run-1", copy), 40000).unwrap();
            ports.allocate(&hop("h2", "run-1", copy), 40000).unwrap();
            ports.allocate(&hop("h1", "run-2", copy), 40000).unwrap();
        }
        assert_eq!(ports.deallocate_all(&RunIdentifier::new("run-1", "load-sales")), 10);
        assert_eq!(ports.len(), 5);
        assert_eq!(ports.deallocate_all(&RunIdentifier::new("run-1", "load-sales")), 0);
        assert!(ports.allocations_for_host("h2").is_empty());
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let ports = PortAllocator::new(2);
        ports.allocate(&hop("h1", "r", 0), 40000).unwrap();
        ports.allocate(&hop("h1", "r", 1), 40000).unwrap();
        let err = ports.allocate(&hop("h1", "r", 2), 40000).unwrap_err();
        assert!(matches!(err, EngineError::PortRangeExhausted { start: 40000, size: 2, .. }));
    }

    #[test]
    fn test_range_is_clamped_at_u16_max() {
        let ports = PortAllocator::new(10);
        assert_eq!(ports.allocate(&hop("h", "r", 0), u16::MAX).unwrap(), u16::MAX);
        assert!(ports.allocate(&hop("h", "r", 1), u16::MAX).is_err());
    }

    #[test]
    fn test_snapshots_are_sorted() {
        let ports = PortAllocator::new(10);
        ports.allocate(&hop("h2", "r", 0), 40000).unwrap();
        ports.allocate(&hop("h1", "r", 0), 40005).unwrap();
        ports.allocate(&hop("h1", "r", 1), 40000).unwrap();

        let listed: Vec<_> = ports
            .allocations()
            .into_iter()
            .map(|(k, p)| (k.host, p))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("h1".to_string(), 40000),
                ("h1".to_string(), 40005),
                ("h2".to_string(), 40000)
            ]
        );
        assert_eq!(ports.port_of(&hop("h1", "r", 0)), Some(40005));
    }

    proptest! {
        #[test]
        fn prop_live_ports_are_unique_per_host(
            ops in prop::collection::vec((0u32..20, any::<bool>()), 1..200)
        ) {
            let ports = PortAllocator::new(32);
            for (copy, release) in ops {
                let key = hop("h1", "r", copy);
                if release {
                    ports.deallocate_key(&key);
                } else {
                    ports.allocate(&key, 40000).unwrap();
                }
                let live: Vec<u16> = ports
                    .allocations_for_host("h1")
                    .into_iter()
                    .map(|(p, _)| p)
                    .collect();
                let unique: HashSet<_> = live.iter().collect();
                prop_assert_eq!(unique.len(), live.len());
                prop_assert!(live.iter().all(|p| (40000..40032).contains(p)));
            }
        }
    }
}
