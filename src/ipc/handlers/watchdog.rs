use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use super::super::IPCServer;
use crate::supervisor::{Supervisor, SupervisorError};

/// GET /api/watchdogs
pub async fn list_watches(State(state): State<IPCServer>) -> Json<Value> {
    let watches = state.supervisor.list_watches().await;
    Json(json!({
        "success": true,
        "message": Supervisor::render_watches(&watches),
        "watchdogs": watches,
    }))
}

/// POST /api/watchdog/:name/start
pub async fn start_watch(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let message = state.supervisor.start_watch(&name).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// POST /api/watchdog/:name/stop
pub async fn stop_watch(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let message = state.supervisor.stop_watch(&name).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// POST /api/watchdog/:name/abort-restart - 대기 중인 재시작 취소
pub async fn abort_restart(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let message = state.supervisor.abort_restart(&name).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}
