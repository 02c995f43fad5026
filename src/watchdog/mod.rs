//! Server process watchdog
//!
//! One background task per watched server polls the process table, reports
//! liveness transitions and, after a crash, opens a restart window that an
//! operator can abort. All notices leave through a single event channel.

pub mod state;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;
use crate::console::ServerConsole;
use crate::crash_report::{self, CrashReports, DEFAULT_CHUNK_SIZE};
use crate::notify::{markdown, MARKDOWN_OVERHEAD};
use crate::process_monitor::{self, ProcessProbe};
use state::{LivenessMachine, Transition};

#[derive(Debug, Clone)]
pub struct WatchTimings {
    pub alive_interval: Duration,
    pub gone_interval: Duration,
    /// Extra pause after a loss before polling resumes.
    pub settle: Duration,
    /// A report younger than this at loss time means "crashed".
    pub crash_grace: Duration,
    pub restart_delay: Duration,
    pub chunk_size: usize,
}

impl Default for WatchTimings {
    fn default() -> Self {
        Self::from(&WatchdogConfig::default())
    }
}

impl From<&WatchdogConfig> for WatchTimings {
    fn from(cfg: &WatchdogConfig) -> Self {
        Self {
            alive_interval: Duration::from_secs(cfg.alive_interval_secs),
            gone_interval: Duration::from_secs(cfg.gone_interval_secs),
            settle: Duration::from_secs(cfg.settle_secs),
            crash_grace: Duration::from_secs(cfg.crash_grace_secs),
            restart_delay: Duration::from_secs(cfg.restart_delay_secs),
            // 청크는 markdown 블록으로 감싸서 보내므로 그만큼 뺀다
            chunk_size: DEFAULT_CHUNK_SIZE - MARKDOWN_OVERHEAD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashNotice {
    pub report: PathBuf,
    pub chunks: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    ServerGone {
        server: String,
        at: DateTime<Local>,
        /// Present when a fresh crash report was found.
        crash: Option<CrashNotice>,
    },
    ServerBack {
        server: String,
        at: DateTime<Local>,
    },
    RestartScheduled {
        server: String,
        delay: Duration,
    },
    RestartAborted {
        server: String,
    },
    AlreadyBack {
        server: String,
    },
    RestartIssued {
        server: String,
    },
    RestartFailed {
        server: String,
        error: String,
    },
    WatchEnded {
        server: String,
    },
    WatchFailed {
        server: String,
        error: String,
    },
}

impl WatchEvent {
    pub fn server(&self) -> &str {
        match self {
            Self::ServerGone { server, .. }
            | Self::ServerBack { server, .. }
            | Self::RestartScheduled { server, .. }
            | Self::RestartAborted { server }
            | Self::AlreadyBack { server }
            | Self::RestartIssued { server }
            | Self::RestartFailed { server, .. }
            | Self::WatchEnded { server }
            | Self::WatchFailed { server, .. } => server,
        }
    }

    /// Operator-facing messages, in send order.
    pub fn render(&self) -> Vec<String> {
        match self {
            Self::ServerGone { server, at, crash: Some(notice) } => {
                let mut out = vec![markdown(&format!(
                    "< {} : {} is gone! >\n< A fresh crash report was found, this looks like a crash! >",
                    at.format("%H:%M"),
                    server
                ))];
                out.extend(notice.chunks.iter().map(|c| markdown(c)));
                out
            }
            Self::ServerGone { server, at, crash: None } => vec![markdown(&format!(
                "< {} : {} is gone! >\n> No recent crash report, it was probably stopped.\n> Watching for it to return...",
                at.format("%H:%M"),
                server
            ))],
            Self::ServerBack { server, at } => vec![markdown(&format!(
                "# {} {} is back online!\n> Continuing watch!",
                at.format("%H:%M"),
                server
            ))],
            Self::RestartScheduled { server, delay } => vec![markdown(&format!(
                "> {} will be started again in {} seconds.\n> Abort the restart to leave it offline.",
                server,
                delay.as_secs()
            ))],
            Self::RestartAborted { server } => {
                vec![markdown(&format!("> Restart of {} aborted, no action taken.", server))]
            }
            Self::AlreadyBack { server } => vec![markdown(&format!("> {} is already back!", server))],
            Self::RestartIssued { server } => vec![markdown(&format!("# Starting {}...", server))],
            Self::RestartFailed { server, error } => {
                vec![markdown(&format!("< Failed to start {}: {} >", server, error))]
            }
            Self::WatchEnded { server } => vec![markdown(&format!("> Ended watch on {}!", server))],
            Self::WatchFailed { server, error } => vec![markdown(&format!(
                "< Watch on {} ended abnormally: {} >\n< Start the watchdog again once resolved. >",
                server, error
            ))],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStart {
    Started { alive: bool },
    AlreadyActive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchStatus {
    pub server: String,
    pub active: bool,
    pub alive: bool,
    pub restart_pending: bool,
}

/// Report mtime within the grace window (or in the future) counts as a crash.
pub fn is_recent(mtime: SystemTime, now: SystemTime, grace: Duration) -> bool {
    match now.duration_since(mtime) {
        Ok(age) => age <= grace,
        Err(_) => true,
    }
}

/// Collaborators shared by every watch task.
struct WatchContext {
    probe: Arc<dyn ProcessProbe>,
    reports: CrashReports,
    console: Arc<ServerConsole>,
    timings: WatchTimings,
    events: mpsc::Sender<WatchEvent>,
}

impl WatchContext {
    /// Waits for room in the event channel only while `cancel` is live.
    async fn emit(&self, event: WatchEvent, cancel: &CancellationToken) {
        let event = match self.events.try_send(event) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("WD: event receiver dropped");
                return;
            }
            Err(mpsc::error::TrySendError::Full(event)) => event,
        };
        let server = event.server().to_string();
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::warn!("WD: event channel full, event for {} dropped", server);
            }
            sent = self.events.send(event) => if sent.is_err() {
                tracing::debug!("WD: event receiver dropped");
            },
        }
    }
}

/// Cancel handle of the restart window currently open for a server.
#[derive(Default)]
struct PendingRestart {
    slot: Mutex<Option<(u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl PendingRestart {
    async fn open(&self, token: CancellationToken) -> u64 {
        let id = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self.slot.lock().await.replace((id, token)) {
            previous.cancel();
        }
        id
    }

    async fn close(&self, id: u64) {
        let mut slot = self.slot.lock().await;
        if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
            *slot = None;
        }
    }

    async fn abort(&self) -> bool {
        match self.slot.lock().await.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn is_open(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

struct WatchState {
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    pending: Arc<PendingRestart>,
    handle: JoinHandle<()>,
}

impl WatchState {
    fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct Watchdog {
    ctx: Arc<WatchContext>,
    watches: Mutex<HashMap<String, WatchState>>,
}

impl Watchdog {
    pub fn new(
        probe: Arc<dyn ProcessProbe>,
        reports: CrashReports,
        console: Arc<ServerConsole>,
        timings: WatchTimings,
        events: mpsc::Sender<WatchEvent>,
    ) -> Self {
        Self {
            ctx: Arc::new(WatchContext {
                probe,
                reports,
                console,
                timings,
                events,
            }),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Starts watching `server`; a second start while active is a no-op.
    pub async fn start_watch(&self, server: &str) -> anyhow::Result<WatchStart> {
        // 락을 잡은 채로 probe까지 끝내야 동시 시작 요청이 태스크를 두 번 만들지 않는다
        let mut watches = self.watches.lock().await;
        if watches.get(server).map_or(false, WatchState::is_active) {
            tracing::info!("WD: {} watchdog already active", server);
            return Ok(WatchStart::AlreadyActive);
        }

        let running = process_monitor::is_running_async(&self.ctx.probe, server).await?;
        let alive = Arc::new(AtomicBool::new(running));
        let cancel = CancellationToken::new();
        let pending = Arc::new(PendingRestart::default());

        let handle = tokio::spawn(supervise_watch(
            self.ctx.clone(),
            server.to_string(),
            alive.clone(),
            cancel.clone(),
            pending.clone(),
        ));

        watches.insert(
            server.to_string(),
            WatchState {
                alive,
                cancel,
                pending,
                handle,
            },
        );
        Ok(WatchStart::Started { alive: running })
    }

    /// Cancels the watch and waits for its task. `false` if none was active.
    pub async fn stop_watch(&self, server: &str) -> bool {
        let Some(state) = self.watches.lock().await.remove(server) else {
            return false;
        };
        let was_active = state.is_active();
        state.cancel.cancel();
        if let Err(e) = state.handle.await {
            tracing::warn!("WD: watch task for {} did not exit cleanly: {}", server, e);
        }
        was_active
    }

    pub async fn is_watching(&self, server: &str) -> bool {
        self.watches
            .lock()
            .await
            .get(server)
            .map_or(false, WatchState::is_active)
    }

    /// Closes an open restart window without starting the server.
    pub async fn abort_restart(&self, server: &str) -> bool {
        let pending = match self.watches.lock().await.get(server) {
            Some(state) => state.pending.clone(),
            None => return false,
        };
        pending.abort().await
    }

    pub async fn list_watches(&self) -> Vec<WatchStatus> {
        let watches = self.watches.lock().await;
        let mut out = Vec::with_capacity(watches.len());
        for (server, state) in watches.iter() {
            out.push(WatchStatus {
                server: server.clone(),
                active: state.is_active(),
                alive: state.alive.load(Ordering::Relaxed),
                restart_pending: state.pending.is_open().await,
            });
        }
        out.sort_by(|a, b| a.server.cmp(&b.server));
        out
    }

    /// Stops every watch.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, WatchState)> = self.watches.lock().await.drain().collect();
        for (_, state) in &drained {
            state.cancel.cancel();
        }
        for (server, state) in drained {
            if let Err(e) = state.handle.await {
                tracing::warn!("WD: watch task for {} did not exit cleanly: {}", server, e);
            }
        }
    }
}

/// Sleeps for `wait` unless cancelled first. `false` means cancelled.
async fn sleep_or_cancel(cancel: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

/// Runs one watch and reports how it ended.
async fn supervise_watch(
    ctx: Arc<WatchContext>,
    server: String,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    pending: Arc<PendingRestart>,
) {
    let inner = tokio::spawn(run_watch(
        ctx.clone(),
        server.clone(),
        alive,
        cancel.clone(),
        pending,
    ));

    let event = match inner.await {
        Ok(Ok(())) => WatchEvent::WatchEnded { server: server.clone() },
        Ok(Err(e)) => {
            tracing::error!("WD: Exception in watchdog for {}: {:#}", server, e);
            WatchEvent::WatchFailed {
                server: server.clone(),
                error: format!("{:#}", e),
            }
        }
        Err(e) => {
            tracing::error!("WD: Watchdog task for {} panicked: {}", server, e);
            WatchEvent::WatchFailed {
                server: server.clone(),
                error: "watch task panicked".to_string(),
            }
        }
    };
    // 감시가 끝나면 열린 재시작 창도 함께 닫힌다
    cancel.cancel();
    ctx.emit(event, &cancel).await;
}

async fn run_watch(
    ctx: Arc<WatchContext>,
    server: String,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    pending: Arc<PendingRestart>,
) -> anyhow::Result<()> {
    tracing::info!("WD: Starting watch on {}.", server);
    let mut machine = LivenessMachine::new(alive.load(Ordering::Relaxed));

    while !cancel.is_cancelled() {
        let wait = machine.poll_interval(ctx.timings.alive_interval, ctx.timings.gone_interval);
        if !sleep_or_cancel(&cancel, wait).await {
            break;
        }

        let running = process_monitor::is_running_async(&ctx.probe, &server).await?;
        match machine.observe(running) {
            Some(Transition::Lost) => {
                tracing::info!("WD: {} is gone!", server);
                alive.store(false, Ordering::Relaxed);
                handle_loss(&ctx, &server, &cancel, &pending).await;
                if !sleep_or_cancel(&cancel, ctx.timings.settle).await {
                    break;
                }
            }
            Some(Transition::Recovered) => {
                tracing::info!("WD: {} is back online!", server);
                alive.store(true, Ordering::Relaxed);
                ctx.emit(
                    WatchEvent::ServerBack {
                        server: server.clone(),
                        at: Local::now(),
                    },
                    &cancel,
                )
                .await;
            }
            None => {}
        }
    }

    tracing::info!("WD: Ending watch on {}.", server);
    Ok(())
}

/// Classifies a loss by crash report age and opens the restart window on a crash.
async fn handle_loss(
    ctx: &Arc<WatchContext>,
    server: &str,
    cancel: &CancellationToken,
    pending: &Arc<PendingRestart>,
) {
    let crash = match find_fresh_report(ctx, server).await {
        Some(path) => {
            let chunks = match crash_report::read_path_chunks(path.clone(), ctx.timings.chunk_size).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::warn!("WD: Could not read crash report for {}: {}", server, e);
                    vec![format!("< Crash report {} could not be read. >", path.display())]
                }
            };
            Some(CrashNotice { report: path, chunks })
        }
        None => None,
    };
    let crashed = crash.is_some();

    ctx.emit(
        WatchEvent::ServerGone {
            server: server.to_string(),
            at: Local::now(),
            crash,
        },
        cancel,
    )
    .await;

    if crashed {
        schedule_restart(ctx.clone(), server.to_string(), cancel.child_token(), pending.clone()).await;
    }
}

async fn find_fresh_report(ctx: &WatchContext, server: &str) -> Option<PathBuf> {
    match ctx.reports.latest_async(server).await {
        Ok(Some((path, mtime))) if is_recent(mtime, SystemTime::now(), ctx.timings.crash_grace) => {
            tracing::info!("WD: Fresh crash report for {}: {}", server, path.display());
            Some(path)
        }
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("WD: Crash report lookup for {} failed: {}", server, e);
            None
        }
    }
}

async fn schedule_restart(
    ctx: Arc<WatchContext>,
    server: String,
    abort: CancellationToken,
    pending: Arc<PendingRestart>,
) {
    let id = pending.open(abort.clone()).await;
    ctx.emit(
        WatchEvent::RestartScheduled {
            server: server.clone(),
            delay: ctx.timings.restart_delay,
        },
        &abort,
    )
    .await;
    tracing::info!("WD: Restart of {} in {:?} unless aborted.", server, ctx.timings.restart_delay);

    tokio::spawn(async move {
        let proceed = sleep_or_cancel(&abort, ctx.timings.restart_delay).await;
        pending.close(id).await;

        if !proceed {
            tracing::info!("WD: Restart of {} aborted.", server);
            ctx.emit(WatchEvent::RestartAborted { server }, &abort).await;
            return;
        }

        let event = match process_monitor::is_running_async(&ctx.probe, &server).await {
            Ok(true) => {
                tracing::info!("WD: {} is already back!", server);
                WatchEvent::AlreadyBack { server }
            }
            Ok(false) => match ctx.console.start(&server).await {
                Ok(()) => WatchEvent::RestartIssued { server },
                Err(e) => {
                    tracing::error!("WD: Failed to start {}: {}", server, e);
                    WatchEvent::RestartFailed {
                        server,
                        error: e.to_string(),
                    }
                }
            },
            Err(e) => WatchEvent::RestartFailed {
                server,
                error: e.to_string(),
            },
        };
        ctx.emit(event, &abort).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_recent_window() {
        let now = SystemTime::now();
        let grace = Duration::from_secs(60);
        assert!(is_recent(now - Duration::from_secs(10), now, grace));
        assert!(is_recent(now - grace, now, grace));
        assert!(!is_recent(now - Duration::from_secs(2 * 3600), now, grace));
        // 시계가 어긋나 미래 시각인 경우도 크래시로 본다
        assert!(is_recent(now + Duration::from_secs(5), now, grace));
    }

    #[test]
    fn test_default_timings_follow_config() {
        let t = WatchTimings::default();
        assert_eq!(t.alive_interval, Duration::from_secs(20));
        assert_eq!(t.gone_interval, Duration::from_secs(60));
        assert_eq!(t.crash_grace, Duration::from_secs(60));
        assert_eq!(t.restart_delay, Duration::from_secs(90));
        assert!(t.chunk_size + MARKDOWN_OVERHEAD <= DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_render_distinguishes_crash_and_stop() {
        let at = Local::now();
        let stopped = WatchEvent::ServerGone {
            server: "survival".into(),
            at,
            crash: None,
        }
        .render();
        assert_eq!(stopped.len(), 1);
        assert!(stopped[0].contains("probably stopped"));

        let crashed = WatchEvent::ServerGone {
            server: "survival".into(),
            at,
            crash: Some(CrashNotice {
                report: PathBuf::from("crash.txt"),
                chunks: vec!["a".into(), "b".into()],
            }),
        }
        .render();
        assert_eq!(crashed.len(), 3);
        assert!(crashed[0].contains("looks like a crash"));
    }

    #[test]
    fn test_render_watch_failed_is_distinct_from_ended() {
        let ended = WatchEvent::WatchEnded { server: "s".into() }.render();
        let failed = WatchEvent::WatchFailed {
            server: "s".into(),
            error: "boom".into(),
        }
        .render();
        assert_ne!(ended, failed);
        assert!(failed[0].contains("abnormally"));
        assert!(failed[0].contains("boom"));
    }

    #[tokio::test]
    async fn test_pending_restart_generations() {
        let pending = PendingRestart::default();
        let first = CancellationToken::new();
        let id1 = pending.open(first.clone()).await;
        let second = CancellationToken::new();
        let id2 = pending.open(second.clone()).await;

        // 새 창이 열리면 이전 창은 취소된다
        assert!(first.is_cancelled());
        // 이전 창의 close는 새 창을 건드리지 않는다
        pending.close(id1).await;
        assert!(pending.is_open().await);
        pending.close(id2).await;
        assert!(!pending.is_open().await);
        assert!(!pending.abort().await);
    }
}
