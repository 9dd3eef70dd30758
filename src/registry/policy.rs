//! Worker selection strategies.
//!
//! Both strategies only consider workers that are `Ready` and below the
//! capacity limit. Neither provides affinity; the choice is replaceable
//! without touching the wire protocol.

use std::collections::HashMap;

use crate::config::SelectionStrategy;
use crate::registry::record::WorkerRecord;

/// Trait for picking a worker among the registry's records.
pub trait SelectionPolicy: Send + Sync + std::fmt::Debug {
    /// Return the id of a qualifying worker, or `None`.
    fn select(&self, records: &HashMap<String, WorkerRecord>, max_connections: u32) -> Option<String>;
}

/// First qualifying worker, ordered by id so the choice is stable.
#[derive(Debug, Default)]
pub struct FirstAvailable;

impl SelectionPolicy for FirstAvailable {
    fn select(&self, records: &HashMap<String, WorkerRecord>, max_connections: u32) -> Option<String> {
        records
            .values()
            .filter(|r| r.is_available(max_connections))
            .min_by(|a, b| a.id.cmp(&b.id))
            .map(|r| r.id.clone())
    }
}

/// Qualifying worker with the fewest active connections.
/// In case of tie, the lowest id is selected (stability).
#[derive(Debug, Default)]
pub struct LeastConnections;

impl SelectionPolicy for LeastConnections {
    fn select(&self, records: &HashMap<String, WorkerRecord>, max_connections: u32) -> Option<String> {
        records
            .values()
            .filter(|r| r.is_available(max_connections))
            .min_by(|a, b| {
                a.active_connections
                    .cmp(&b.active_connections)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|r| r.id.clone())
    }
}

/// Build the policy named in configuration.
pub fn from_strategy(strategy: SelectionStrategy) -> Box<dyn SelectionPolicy> {
    match strategy {
        SelectionStrategy::FirstAvailable => Box::new(FirstAvailable),
        SelectionStrategy::LeastConnections => Box::new(LeastConnections),
    }
}
