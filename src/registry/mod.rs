//! Session registry: worker capacity and status used for load balancing.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     store.rs (load every persisted record) → in-memory map
//!
//! Dispatch:
//!     acquire() → policy.rs (pick Ready worker under capacity)
//!               → add_connection() under the same lock
//!     none → create(id) for a cold-started worker
//!
//! Session actor notifications:
//!     ready → set_status(Ready)     closing → set_status(Closing)
//!     outgoing-close → remove_connection()
//!     connection closed → delete()
//! ```
//!
//! # Design Decisions
//! - One lock serializes all operations, so each read-modify-write is atomic
//! - Every mutation is persisted before the in-memory map changes

pub mod policy;
pub mod record;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::config::PoolConfig;
use crate::observability::metrics;

pub use policy::{FirstAvailable, LeastConnections, SelectionPolicy};
pub use record::{WorkerRecord, WorkerStatus};
pub use store::{JsonFileStore, MemoryStore, RecordStore, StoreError};

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Durable map from worker id to capacity and status.
#[derive(Debug)]
pub struct Registry {
    records: Mutex<HashMap<String, WorkerRecord>>,
    store: Arc<dyn RecordStore>,
    policy: Box<dyn SelectionPolicy>,
    max_connections: u32,
}

impl Registry {
    /// Load every persisted record and build the registry from pool config.
    pub fn load(store: Arc<dyn RecordStore>, pool: &PoolConfig) -> Result<Self, RegistryError> {
        Self::with_policy(
            store,
            pool.max_connections_per_worker,
            policy::from_strategy(pool.policy),
        )
    }

    /// Load every persisted record using an explicit selection policy.
    pub fn with_policy(
        store: Arc<dyn RecordStore>,
        max_connections: u32,
        policy: Box<dyn SelectionPolicy>,
    ) -> Result<Self, RegistryError> {
        let records: HashMap<String, WorkerRecord> = store
            .load_all()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        tracing::info!(
            workers = records.len(),
            max_connections,
            policy = ?policy,
            "Registry loaded"
        );
        metrics::record_workers(records.len());

        Ok(Self {
            records: Mutex::new(records),
            store,
            policy,
            max_connections,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WorkerRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Capacity limit per worker.
    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Return any `Ready` worker below capacity.
    pub fn select(&self) -> Option<String> {
        let records = self.lock();
        self.policy.select(&records, self.max_connections)
    }

    /// Select a worker and count the new connection against it atomically.
    pub fn acquire(&self) -> Result<Option<String>, RegistryError> {
        let mut records = self.lock();
        let Some(id) = self.policy.select(&records, self.max_connections) else {
            return Ok(None);
        };
        self.mutate(&mut records, &id, |r| r.active_connections += 1)?;
        Ok(Some(id))
    }

    /// Insert a pending record for a cold-started worker, overwriting any existing one.
    pub fn create(&self, id: &str) -> Result<(), RegistryError> {
        let mut records = self.lock();
        let record = WorkerRecord::pending(id);
        self.store.put(&record)?;
        records.insert(id.to_string(), record);
        metrics::record_workers(records.len());
        tracing::debug!(worker_id = %id, "Worker record created");
        Ok(())
    }

    pub fn set_status(&self, id: &str, status: WorkerStatus) -> Result<(), RegistryError> {
        let mut records = self.lock();
        self.mutate(&mut records, id, |r| r.status = status)?;
        tracing::debug!(worker_id = %id, status = %status, "Worker status updated");
        Ok(())
    }

    pub fn add_connection(&self, id: &str) -> Result<(), RegistryError> {
        let mut records = self.lock();
        self.mutate(&mut records, id, |r| r.active_connections += 1)
    }

    /// Release one connection; never goes below zero.
    pub fn remove_connection(&self, id: &str) -> Result<(), RegistryError> {
        let mut records = self.lock();
        self.mutate(&mut records, id, |r| {
            r.active_connections = r.active_connections.saturating_sub(1)
        })
    }

    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let mut records = self.lock();
        if !records.contains_key(id) {
            return Err(RegistryError::WorkerNotFound(id.to_string()));
        }
        self.store.delete(id)?;
        records.remove(id);
        metrics::record_workers(records.len());
        tracing::debug!(worker_id = %id, "Worker record deleted");
        Ok(())
    }

    /// Current record for one worker.
    pub fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.lock().get(id).cloned()
    }

    /// All records, ordered by id.
    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn mutate(
        &self,
        records: &mut HashMap<String, WorkerRecord>,
        id: &str,
        f: impl FnOnce(&mut WorkerRecord),
    ) -> Result<(), RegistryError> {
        let mut updated = records
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::WorkerNotFound(id.to_string()))?;
        f(&mut updated);
        self.store.put(&updated)?;
        records.insert(id.to_string(), updated);
        Ok(())
    }
}
