//! Persistence backends for worker records.
//!
//! # Responsibilities
//! - Load the full record set on startup
//! - Persist each mutated record
//! - Remove records of workers that closed

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::registry::record::WorkerRecord;

/// Errors raised by a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Key-value store holding one record per worker id.
pub trait RecordStore: Send + Sync + std::fmt::Debug {
    /// Read every persisted record.
    fn load_all(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    /// Insert or overwrite the record keyed by `record.id`.
    fn put(&self, record: &WorkerRecord) -> Result<(), StoreError>;

    /// Remove the record keyed by `id`. Absent keys are not an error.
    fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Volatile store, used when no storage path is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, WorkerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with records.
    pub fn with_records(records: impl IntoIterator<Item = WorkerRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock().unwrap_or_else(|e| e.into_inner());
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        store
    }
}

impl RecordStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.values().cloned().collect())
    }

    fn put(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        let mut map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(id);
        Ok(())
    }
}

/// Store persisting the record map as a JSON snapshot file.
///
/// The whole map is rewritten on every mutation. Worker counts are small, so
/// the snapshot stays cheap.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<String, WorkerRecord>>,
}

impl JsonFileStore {
    /// Open the store, reading the snapshot if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            HashMap::new()
        };
        tracing::info!(path = ?path, records = records.len(), "Opened worker record store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write the snapshot beside the target, then rename it into place so a
    /// crash never leaves a truncated file behind.
    fn save(&self, records: &HashMap<String, WorkerRecord>) -> Result<(), StoreError> {
        let tmp = self.temp_path();
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut writer, records)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RecordStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.values().cloned().collect())
    }

    fn put(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        let mut map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(record.id.clone(), record.clone());
        self.save(&map)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut map = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if map.remove(id).is_some() {
            self.save(&map)?;
        }
        Ok(())
    }
}
