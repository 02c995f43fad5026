use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};

use super::super::{CommandRequest, CrashReportQuery, IPCServer};
use crate::supervisor::SupervisorError;

/// GET /api/servers - 설정된 모든 서버 상태
pub async fn list_servers(State(state): State<IPCServer>) -> Result<Json<Value>, SupervisorError> {
    let servers = state.supervisor.server_status(None).await?;
    Ok(Json(json!({ "success": true, "servers": servers })))
}

/// GET /api/server/:name/status
pub async fn get_server_status(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let status = state.supervisor.server_status(Some(&name)).await?;
    let message = match status.first() {
        Some(s) if s.running => format!("# {} is running.", name),
        _ => format!("< {} is not running! >", name),
    };
    Ok(Json(json!({ "success": true, "message": message, "server": status.first() })))
}

/// POST /api/server/:name/start
pub async fn start_server(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let message = state.supervisor.start_server(&name).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// POST /api/server/:name/stop
pub async fn stop_server(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let message = state.supervisor.stop_server(&name).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// POST /api/server/:name/terminate - 프로세스 트리 강제 종료
pub async fn terminate_server(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let message = state.supervisor.terminate_server(&name).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// POST /api/server/:name/command - 콘솔에 한 줄 전송
pub async fn send_command(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<Value>, SupervisorError> {
    let message = state.supervisor.send_command(&name, &req.command).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// GET /api/server/:name/crash-report?nth=N
pub async fn get_crash_report(
    Path(name): Path<String>,
    Query(query): Query<CrashReportQuery>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let chunks = state.supervisor.get_crash_report(&name, query.nth).await?;
    Ok(Json(json!({ "success": true, "server": name, "nth": query.nth, "chunks": chunks })))
}
