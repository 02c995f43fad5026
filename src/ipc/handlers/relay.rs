use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use super::super::{ChannelMessageRequest, IPCServer, RegisterRequest, RelayStartRequest, UnregisterRequest};
use crate::supervisor::SupervisorError;

/// GET /api/relay
pub async fn relay_status(State(state): State<IPCServer>) -> Json<Value> {
    let status = state.supervisor.relay_status().await;
    Json(json!({ "success": true, "message": status.render(), "status": status }))
}

/// POST /api/relay/start - body `{port?}`, 없으면 설정의 포트
pub async fn start_relay(
    State(state): State<IPCServer>,
    body: Option<Json<RelayStartRequest>>,
) -> Result<Json<Value>, SupervisorError> {
    let port = body.and_then(|Json(req)| req.port);
    let message = state.supervisor.start_relay(port).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// POST /api/relay/stop
pub async fn stop_relay(State(state): State<IPCServer>) -> Json<Value> {
    let message = state.supervisor.stop_relay().await;
    Json(json!({ "success": true, "message": message }))
}

/// POST /api/relay/register
pub async fn register_channel(
    State(state): State<IPCServer>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, SupervisorError> {
    let message = state.supervisor.register_channel(&req.client, &req.channel).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// POST /api/relay/unregister
pub async fn unregister_channel(
    State(state): State<IPCServer>,
    Json(req): Json<UnregisterRequest>,
) -> Result<Json<Value>, SupervisorError> {
    let message = state.supervisor.unregister_channel(&req.client).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// POST /api/relay/channel/:id/message - 채널 채팅을 연결된 클라이언트로 전달
pub async fn relay_from_channel(
    Path(channel): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<ChannelMessageRequest>,
) -> Json<Value> {
    let delivered = state
        .supervisor
        .relay_from_channel(&channel, &req.author, &req.content)
        .await;
    Json(json!({ "success": true, "delivered": delivered }))
}
