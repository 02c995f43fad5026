use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mcwarden::config::{GlobalConfig, DEFAULT_CONFIG_PATH};
use mcwarden::notify::{self, Dispatcher};
use mcwarden::{ipc, supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("mcwarden starting");

    let config_path = std::env::var("MCWARDEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = GlobalConfig::load(&config_path)?;
    tracing::info!(
        "Loaded config from {} ({} servers)",
        config_path,
        cfg.servers.instances.len()
    );

    let shutdown = CancellationToken::new();
    // Dispatcher는 마지막 알림까지 보낸 뒤에 멈춘다
    let dispatch_stop = CancellationToken::new();

    // 모든 알림은 하나의 채널을 거쳐 Dispatcher로
    let (sink, outbox) = notify::channel(256);
    let dispatcher = Dispatcher::new(cfg.notify.webhooks.clone()).spawn(outbox, dispatch_stop.clone());

    let (events_tx, events_rx) = mpsc::channel(64);
    let pump = notify::spawn_watch_pump(
        events_rx,
        sink.clone(),
        cfg.notify.channel.clone(),
        cfg.notify.chunk_delay(),
    );

    let listen = cfg.ipc.listen.clone();
    let autostart = cfg.relay.autostart;
    let supervisor = Arc::new(supervisor::Supervisor::from_config(cfg, sink, events_tx)?);

    if autostart {
        match supervisor.start_relay(None).await {
            Ok(msg) => tracing::info!("{}", msg),
            Err(e) => tracing::error!("Relay autostart failed: {}", e),
        }
    }

    // Graceful shutdown: Ctrl+C 시 정리
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received, cleaning up...");
        signal_token.cancel();
    });

    let ipc_server = ipc::IPCServer::new(supervisor.clone(), &listen);
    if let Err(e) = ipc_server.start(shutdown.clone()).await {
        tracing::error!("IPC server error: {}", e);
    }
    shutdown.cancel();

    supervisor.shutdown().await;
    // supervisor가 내려가면 이벤트 송신자가 사라져 pump도 끝난다
    drop(supervisor);
    if let Err(e) = pump.await {
        tracing::warn!("Watch event pump ended abnormally: {}", e);
    }
    dispatch_stop.cancel();
    if let Err(e) = dispatcher.await {
        tracing::warn!("Dispatcher ended abnormally: {}", e);
    }

    tracing::info!("mcwarden shutting down");
    Ok(())
}
