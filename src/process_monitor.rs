//! OS process table probe for supervised servers.
//!
//! A server is identified by the `<server>.jar` token on its command line,
//! which is how the launch invocations in `config/global.toml` start them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, System, UpdateKind};

/// How long `terminate` waits after each signal round.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);
const REAP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    /// 프로세스 커맨드라인 인수 (예: ["java", "-jar", "survival.jar", "nogui"])
    #[serde(default)]
    pub cmd: Vec<String>,
}

/// Command line token identifying a server's process.
pub fn server_token(server: &str) -> String {
    format!("{}.jar", server)
}

/// An argument matches when it is the token itself or a path ending in it.
pub fn cmdline_matches(cmd: &[String], token: &str) -> bool {
    cmd.iter().any(|arg| {
        arg == token
            || Path::new(arg)
                .file_name()
                .map_or(false, |name| name == token)
    })
}

fn is_alive(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Linux lists threads as tasks that share the parent's argv.
fn is_main_task(process: &Process) -> bool {
    process.thread_kind().is_none()
}

/// `refresh_processes()` leaves `cmd()` empty; the token lives there.
fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet)
}

fn snapshot() -> System {
    let mut sys = System::new();
    sys.refresh_processes_specifics(refresh_kind());
    sys
}

fn find_in(sys: &System, token: &str) -> Option<(Pid, RunningProcess)> {
    sys.processes()
        .iter()
        .filter(|(_, p)| is_main_task(p) && is_alive(p))
        .find(|(_, p)| cmdline_matches(p.cmd(), token))
        .map(|(pid, p)| {
            (
                *pid,
                RunningProcess {
                    pid: pid.as_u32(),
                    name: p.name().to_string(),
                    cmd: p.cmd().to_vec(),
                },
            )
        })
}

/// All transitive children of `root`, children before grandchildren.
fn descendants(sys: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes().iter().filter(|(_, p)| is_main_task(p)) {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                if *kid != root && !found.contains(kid) {
                    found.push(*kid);
                    frontier.push(*kid);
                }
            }
        }
    }
    found
}

#[cfg(unix)]
fn send_signal(_sys: &System, pid: Pid, force: bool) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = signal::kill(NixPid::from_raw(pid.as_u32() as i32), sig) {
        // ESRCH: 이미 종료된 프로세스
        tracing::debug!("Failed to send {:?} to pid {}: {}", sig, pid, e);
    }
}

#[cfg(not(unix))]
fn send_signal(sys: &System, pid: Pid, force: bool) {
    if let Some(process) = sys.process(pid) {
        let delivered = if force {
            process.kill()
        } else {
            process.kill_with(sysinfo::Signal::Term).unwrap_or_else(|| process.kill())
        };
        if !delivered {
            tracing::debug!("Failed to signal pid {}", pid);
        }
    }
}

/// Waits until none of `pids` is alive or `timeout` passes; returns survivors.
fn wait_for_exit(sys: &mut System, pids: &[Pid], timeout: Duration) -> Vec<Pid> {
    let started = Instant::now();
    loop {
        sys.refresh_processes_specifics(refresh_kind());
        let survivors: Vec<Pid> = pids
            .iter()
            .copied()
            .filter(|pid| sys.process(*pid).map_or(false, is_alive))
            .collect();
        if survivors.is_empty() || started.elapsed() >= timeout {
            return survivors;
        }
        std::thread::sleep(REAP_POLL);
    }
}

/// Scans the process table for the server's process.
pub fn find_process(server: &str) -> Option<RunningProcess> {
    let sys = snapshot();
    find_in(&sys, &server_token(server)).map(|(_, p)| p)
}

pub fn is_running(server: &str) -> bool {
    find_process(server).is_some()
}

/// Terminates the server process and its whole process tree.
///
/// SIGTERM first, SIGKILL for whatever survives the grace window.
/// Returns `false` when nothing matched or something is still alive.
pub fn terminate(server: &str) -> bool {
    let mut sys = snapshot();
    let Some((root, _)) = find_in(&sys, &server_token(server)) else {
        tracing::debug!("No process found for '{}', nothing to terminate", server);
        return false;
    };

    let mut targets = descendants(&sys, root);
    targets.push(root);
    tracing::info!(
        "Terminating '{}' (pid {}) with {} child process(es)",
        server,
        root,
        targets.len() - 1
    );

    for pid in &targets {
        send_signal(&sys, *pid, false);
    }
    let survivors = wait_for_exit(&mut sys, &targets, TERMINATE_GRACE);
    if survivors.is_empty() {
        return true;
    }

    tracing::warn!(
        "{} process(es) of '{}' survived SIGTERM, killing",
        survivors.len(),
        server
    );
    for pid in &survivors {
        send_signal(&sys, *pid, true);
    }
    let survivors = wait_for_exit(&mut sys, &survivors, TERMINATE_GRACE);
    if !survivors.is_empty() {
        tracing::error!("Could not terminate {} process(es) of '{}'", survivors.len(), server);
    }
    survivors.is_empty()
}

// ── Probe seam ─────────────────────────────────────────────
// Watchdog는 이 트레이트를 통해서만 프로세스 테이블을 본다.
// 테스트에서는 스크립트된 probe로 교체한다.

pub trait ProcessProbe: Send + Sync + 'static {
    fn is_running(&self, server: &str) -> bool;
    fn find_process(&self, server: &str) -> Option<RunningProcess>;
    fn terminate(&self, server: &str) -> bool;
}

/// sysinfo-backed probe over the real process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_running(&self, server: &str) -> bool {
        is_running(server)
    }

    fn find_process(&self, server: &str) -> Option<RunningProcess> {
        find_process(server)
    }

    fn terminate(&self, server: &str) -> bool {
        terminate(server)
    }
}

// ── Async wrappers ─────────────────────────────────────────
// sysinfo 스캔은 동기적으로 OS 프로세스 테이블 전체를 읽으므로
// spawn_blocking으로 전용 블로킹 스레드풀에서 실행합니다.

pub async fn is_running_async(probe: &Arc<dyn ProcessProbe>, server: &str) -> anyhow::Result<bool> {
    let probe = probe.clone();
    let server = server.to_string();
    tokio::task::spawn_blocking(move || probe.is_running(&server))
        .await
        .map_err(|e| anyhow::anyhow!("process probe task failed: {}", e))
}

pub async fn find_process_async(
    probe: &Arc<dyn ProcessProbe>,
    server: &str,
) -> anyhow::Result<Option<RunningProcess>> {
    let probe = probe.clone();
    let server = server.to_string();
    tokio::task::spawn_blocking(move || probe.find_process(&server))
        .await
        .map_err(|e| anyhow::anyhow!("process probe task failed: {}", e))
}

pub async fn terminate_async(probe: &Arc<dyn ProcessProbe>, server: &str) -> anyhow::Result<bool> {
    let probe = probe.clone();
    let server = server.to_string();
    tokio::task::spawn_blocking(move || probe.terminate(&server))
        .await
        .map_err(|e| anyhow::anyhow!("terminate task failed: {}", e))
}
