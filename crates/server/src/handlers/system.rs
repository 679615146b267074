//! Health and operator status handlers.

use crate::buffer_pool::BufferPoolStats;
use crate::concurrency::ConcurrencySnapshot;
use crate::error::ApiResult;
use crate::memory::MemorySnapshot;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;
use std::collections::BTreeMap;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /health - Health check.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    // Check metadata store connectivity
    state.metadata.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// Operator view of the pipeline's shared resources.
#[derive(Debug, Serialize)]
pub struct SystemStatusResponse {
    pub concurrency: ConcurrencySnapshot,
    pub memory: MemorySnapshot,
    pub buffer_pool: BufferPoolStats,
    /// Persisted sessions by status.
    pub sessions: BTreeMap<String, u64>,
    /// Backup copies still tracked, when a backup destination is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_tasks: Option<usize>,
}

/// GET /system/status - Concurrency, memory and buffer pool occupancy.
pub async fn system_status(State(state): State<AppState>) -> ApiResult<Json<SystemStatusResponse>> {
    let sessions = state
        .metadata
        .count_by_status()
        .await?
        .into_iter()
        .collect();

    let backup_tasks = match &state.backup_registry {
        Some(registry) => Some(registry.tracked().await),
        None => None,
    };

    Ok(Json(SystemStatusResponse {
        concurrency: state.concurrency.snapshot(),
        memory: state.memory.current_usage_snapshot(),
        buffer_pool: state.buffers.stats(),
        sessions,
        backup_tasks,
    }))
}
