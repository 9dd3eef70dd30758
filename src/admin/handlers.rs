use axum::{
    extract::State,
    Json,
};
use serde::{Deserialize, Serialize};
use crate::http::server::AppState;
use crate::registry::{WorkerRecord, WorkerStatus};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub workers: usize,
    pub ready_workers: usize,
    pub active_connections: u64,
    pub live_sessions: usize,
    pub max_connections_per_worker: u32,
}

pub async fn get_status(
    State(state): State<AppState>,
) -> Json<SystemStatus> {
    let records = state.registry.snapshot();
    let ready_workers = records.iter().filter(|r| r.status == WorkerStatus::Ready).count();
    let active_connections = records.iter().map(|r| r.active_connections as u64).sum();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "operational".to_string(),
        workers: records.len(),
        ready_workers,
        active_connections,
        live_sessions: state.sessions.len(),
        max_connections_per_worker: state.registry.max_connections(),
    })
}

pub async fn get_workers(
    State(state): State<AppState>,
) -> Json<Vec<WorkerRecord>> {
    Json(state.registry.snapshot())
}
