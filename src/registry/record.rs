//! Worker record persisted by the registry.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Cold start requested, duplex connection not yet ready.
    Pending,
    /// Duplex connection open and accepting requests.
    Ready,
    /// Worker announced it is going away.
    Closing,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Capacity and status of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub id: String,
    pub active_connections: u32,
    pub status: WorkerStatus,
}

impl WorkerRecord {
    /// A freshly cold-started worker.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active_connections: 0,
            status: WorkerStatus::Pending,
        }
    }

    /// True if the worker can take another request.
    pub fn is_available(&self, max_connections: u32) -> bool {
        self.status == WorkerStatus::Ready && self.active_connections < max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability() {
        let mut record = WorkerRecord::pending("w1");
        assert!(!record.is_available(5));

        record.status = WorkerStatus::Ready;
        record.active_connections = 4;
        assert!(record.is_available(5));

        record.active_connections = 5;
        assert!(!record.is_available(5));

        record.active_connections = 0;
        record.status = WorkerStatus::Closing;
        assert!(!record.is_available(5));
    }

    #[test]
    fn test_serialized_shape() {
        let record = WorkerRecord::pending("w1");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["activeConnections"], 0);
        assert_eq!(json["status"], "pending");
    }
}
