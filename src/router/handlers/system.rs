//! Health and metrics snapshot handlers — the only REST surface the engine
//! answers directly.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::docker::traits::ContainerRuntime;

use super::super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthInfo {
    pub status: &'static str,
    pub version: String,
}

pub async fn healthz() -> Json<HealthInfo> {
    Json(HealthInfo { status: "ok", version: env!("CARGO_PKG_VERSION").to_string() })
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub version: String,
    pub cpu_count: usize,
    pub active_containers: usize,
}

pub async fn metrics<R: ContainerRuntime>(State(state): State<AppState<R>>) -> Json<MetricsSnapshot> {
    Json(MetricsSnapshot {
        version: env!("CARGO_PKG_VERSION").to_string(),
        cpu_count: num_cpus::get(),
        active_containers: state.pool.list_active().len(),
    })
}
