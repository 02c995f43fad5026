//! Local HTTP control surface
//!
//! Thin axum layer over [`Supervisor`]; every response is JSON with a
//! `success` flag and the operator text in `message`.

mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::supervisor::Supervisor;

/// IPC 요청/응답 타입
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayStartRequest {
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client: String,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub client: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessageRequest {
    pub author: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrashReportQuery {
    /// 0 = newest
    #[serde(default)]
    pub nth: usize,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/servers", get(handlers::server::list_servers))
            .route("/api/server/:name/status", get(handlers::server::get_server_status))
            .route("/api/server/:name/start", post(handlers::server::start_server))
            .route("/api/server/:name/stop", post(handlers::server::stop_server))
            .route("/api/server/:name/terminate", post(handlers::server::terminate_server))
            .route("/api/server/:name/command", post(handlers::server::send_command))
            .route("/api/server/:name/crash-report", get(handlers::server::get_crash_report))
            .route("/api/watchdogs", get(handlers::watchdog::list_watches))
            .route("/api/watchdog/:name/start", post(handlers::watchdog::start_watch))
            .route("/api/watchdog/:name/stop", post(handlers::watchdog::stop_watch))
            .route("/api/watchdog/:name/abort-restart", post(handlers::watchdog::abort_restart))
            .route("/api/relay", get(handlers::relay::relay_status))
            .route("/api/relay/start", post(handlers::relay::start_relay))
            .route("/api/relay/stop", post(handlers::relay::stop_relay))
            .route("/api/relay/register", post(handlers::relay::register_channel))
            .route("/api/relay/unregister", post(handlers::relay::unregister_channel))
            .route("/api/relay/channel/:id/message", post(handlers::relay::relay_from_channel))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serves until `shutdown` fires.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        // TCP 리스너
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("IPC HTTP server stopped");
        Ok(())
    }
}
