pub mod error;

pub use error::SupervisorError;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::GlobalConfig;
use crate::console::{CommandChannel, ScreenChannel, ServerConsole};
use crate::crash_report::{CrashReports, DEFAULT_CHUNK_SIZE};
use crate::notify::{markdown, ChannelSender, MARKDOWN_OVERHEAD};
use crate::process_monitor::{self, ProcessProbe, SystemProbe};
use crate::relay::bindings::BindingStore;
use crate::relay::{RegisterOutcome, RelayServer, RelaySettings, RelayStatus};
use crate::watchdog::{WatchEvent, WatchStart, WatchStatus, WatchTimings, Watchdog};

type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub watched: bool,
}

/// Operator-facing facade over console, watchdog, crash reports and relay.
///
/// Every operation answers with text meant for an operator, or a
/// [`SupervisorError`] whose `Display` is that text.
pub struct Supervisor {
    config: GlobalConfig,
    probe: Arc<dyn ProcessProbe>,
    console: Arc<ServerConsole>,
    reports: CrashReports,
    watchdog: Watchdog,
    relay: RelayServer,
}

impl Supervisor {
    pub fn new(
        config: GlobalConfig,
        probe: Arc<dyn ProcessProbe>,
        channel: Arc<dyn CommandChannel>,
        bindings: BindingStore,
        sink: ChannelSender,
        events: mpsc::Sender<WatchEvent>,
    ) -> Self {
        let console = Arc::new(ServerConsole::new(channel, config.servers.clone()));
        let reports = CrashReports::new(config.servers.path.clone());
        let watchdog = Watchdog::new(
            probe.clone(),
            reports.clone(),
            console.clone(),
            WatchTimings::from(&config.watchdog),
            events,
        );
        let relay = RelayServer::new(RelaySettings::from(&config.relay), bindings, sink);
        Self {
            config,
            probe,
            console,
            reports,
            watchdog,
            relay,
        }
    }

    /// Real process table, GNU screen, bindings file from the config.
    pub fn from_config(config: GlobalConfig, sink: ChannelSender, events: mpsc::Sender<WatchEvent>) -> anyhow::Result<Self> {
        let bindings = BindingStore::load(config.relay.bindings_file.clone())?;
        Ok(Self::new(
            config,
            Arc::new(SystemProbe),
            Arc::new(ScreenChannel::default()),
            bindings,
            sink,
            events,
        ))
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    fn ensure_configured(&self, server: &str) -> Result<()> {
        if self.console.is_configured(server) {
            Ok(())
        } else {
            Err(SupervisorError::ServerNotFound(server.to_string()))
        }
    }

    async fn is_running(&self, server: &str) -> Result<bool> {
        Ok(process_monitor::is_running_async(&self.probe, server).await?)
    }

    // ─── Servers ─────────────────────────────────────────────

    /// Status of one server, or of every configured server.
    pub async fn server_status(&self, server: Option<&str>) -> Result<Vec<ServerStatus>> {
        let names: Vec<String> = match server {
            Some(name) => {
                self.ensure_configured(name)?;
                vec![name.to_string()]
            }
            None => {
                let mut names: Vec<String> = self.console.servers().map(String::from).collect();
                names.sort();
                names
            }
        };

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let process = process_monitor::find_process_async(&self.probe, &name).await?;
            out.push(ServerStatus {
                running: process.is_some(),
                pid: process.map(|p| p.pid),
                watched: self.watchdog.is_watching(&name).await,
                name,
            });
        }
        Ok(out)
    }

    pub async fn start_server(&self, server: &str) -> Result<String> {
        self.ensure_configured(server)?;
        if self.is_running(server).await? {
            return Err(SupervisorError::AlreadyRunning(server.to_string()));
        }
        self.console.start(server).await?;
        Ok(format!("# Starting {}...", server))
    }

    /// Announces, saves and stops a running server.
    pub async fn stop_server(&self, server: &str) -> Result<String> {
        self.ensure_configured(server)?;
        if !self.is_running(server).await? {
            return Err(SupervisorError::NotRunning(server.to_string()));
        }
        self.console.stop(server).await?;
        Ok(format!("# Stop command issued to {}.", server))
    }

    /// One raw console line.
    pub async fn send_command(&self, server: &str, command: &str) -> Result<String> {
        self.ensure_configured(server)?;
        if !self.is_running(server).await? {
            return Err(SupervisorError::NotRunning(server.to_string()));
        }
        self.console.send(server, command).await?;
        Ok(format!("> Sent \"{}\" to {}.", command, server))
    }

    /// Signals the server's process tree; last resort for a hung server.
    pub async fn terminate_server(&self, server: &str) -> Result<String> {
        self.ensure_configured(server)?;
        if process_monitor::terminate_async(&self.probe, server).await? {
            Ok(format!("# {} terminated.", server))
        } else {
            Err(SupervisorError::NotRunning(server.to_string()))
        }
    }

    /// Report #`ordinal` (0 = newest) as markdown-wrapped messages.
    pub async fn get_crash_report(&self, server: &str, ordinal: usize) -> Result<Vec<String>> {
        self.ensure_configured(server)?;
        let chunks = self
            .reports
            .read_chunks(server, ordinal, DEFAULT_CHUNK_SIZE - MARKDOWN_OVERHEAD)
            .await?;
        Ok(chunks.iter().map(|c| markdown(c)).collect())
    }

    // ─── Watchdog ────────────────────────────────────────────

    pub async fn start_watch(&self, server: &str) -> Result<String> {
        self.ensure_configured(server)?;
        let msg = match self.watchdog.start_watch(server).await? {
            WatchStart::Started { alive: true } => {
                format!("# Watchdog for {} started, server is running.", server)
            }
            WatchStart::Started { alive: false } => format!(
                "> Watchdog for {} started.\n< {} is currently not running! >",
                server, server
            ),
            WatchStart::AlreadyActive => format!("> Watchdog for {} is already active!", server),
        };
        Ok(msg)
    }

    pub async fn stop_watch(&self, server: &str) -> Result<String> {
        if self.watchdog.stop_watch(server).await {
            Ok(format!("# Watchdog for {} stopped.", server))
        } else {
            Ok(format!("> No active watchdog for {}.", server))
        }
    }

    pub async fn list_watches(&self) -> Vec<WatchStatus> {
        self.watchdog.list_watches().await
    }

    pub fn render_watches(watches: &[WatchStatus]) -> String {
        if watches.is_empty() {
            return "> No watchdogs active.".to_string();
        }
        let mut lines = vec!["# Watchdogs:".to_string()];
        for w in watches {
            let state = match (w.active, w.alive) {
                (false, _) => "ended",
                (true, true) => "watching, server up",
                (true, false) => "watching, server down",
            };
            let pending = if w.restart_pending { " (restart pending)" } else { "" };
            lines.push(format!("- {}: {}{}", w.server, state, pending));
        }
        lines.join("\n")
    }

    pub async fn abort_restart(&self, server: &str) -> Result<String> {
        if self.watchdog.abort_restart(server).await {
            Ok(format!("> Restart of {} aborted.", server))
        } else {
            Ok(format!("> No pending restart for {}.", server))
        }
    }

    // ─── Relay ───────────────────────────────────────────────

    /// Starts the relay on `port`, or the configured port.
    pub async fn start_relay(&self, port: Option<u16>) -> Result<String> {
        let addr = self.relay.start(port.unwrap_or(self.config.relay.port)).await?;
        Ok(format!("# Relay server started on {}.", addr))
    }

    pub async fn stop_relay(&self) -> String {
        if self.relay.stop().await {
            "# Relay server closed, all clients disconnected!".to_string()
        } else {
            "> No relay server to be closed.".to_string()
        }
    }

    pub async fn relay_status(&self) -> RelayStatus {
        self.relay.status().await
    }

    pub async fn register_channel(&self, client: &str, channel: &str) -> Result<String> {
        let msg = match self.relay.register(client, channel).await? {
            RegisterOutcome::Registered { client_connected: true } => format!(
                "# {} is now registered for receiving chat from, and sending chat to {}.",
                channel, client
            ),
            RegisterOutcome::Registered { client_connected: false } => format!(
                "< Client unknown, registering anyway. >\n< Please check if you got the name right, when the client eventually connects. >\n# {} is now registered for receiving chat from, and sending chat to {}.",
                channel, client
            ),
            RegisterOutcome::AlreadyRegistered => {
                format!("> {} is already registered with this channel!", client)
            }
        };
        Ok(msg)
    }

    pub async fn unregister_channel(&self, client: &str) -> Result<String> {
        let channel = self.relay.unregister(client).await?;
        Ok(format!(
            "# {} will no longer send chat to or receive chat from {}!",
            channel, client
        ))
    }

    /// Chat typed in an external channel; returns how many clients got it.
    pub async fn relay_from_channel(&self, channel: &str, author: &str, content: &str) -> usize {
        self.relay.relay_from_channel(channel, author, content).await
    }

    /// Stops every watch and the relay.
    pub async fn shutdown(&self) {
        self.watchdog.shutdown().await;
        self.relay.stop().await;
        tracing::info!("Supervisor shut down");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::console::{CommandChannel, ConsoleError};
    use crate::process_monitor::{ProcessProbe, RunningProcess};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;

    /// Probe over a fixed set of "running" servers.
    #[derive(Default)]
    pub struct FakeProbe {
        pub running: Mutex<HashSet<String>>,
    }

    impl FakeProbe {
        pub fn with(servers: &[&str]) -> Self {
            Self {
                running: Mutex::new(servers.iter().map(|s| s.to_string()).collect()),
            }
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_running(&self, server: &str) -> bool {
            self.running.lock().unwrap().contains(server)
        }

        fn find_process(&self, server: &str) -> Option<RunningProcess> {
            self.is_running(server).then(|| RunningProcess {
                pid: 4242,
                name: "java".to_string(),
                cmd: vec!["java".to_string(), format!("{}.jar", server)],
            })
        }

        fn terminate(&self, server: &str) -> bool {
            self.running.lock().unwrap().remove(server)
        }
    }

    #[derive(Default)]
    pub struct NullChannel {
        pub launches: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandChannel for NullChannel {
        async fn send_line(&self, _session: &str, _line: &str) -> Result<(), ConsoleError> {
            Ok(())
        }

        async fn launch(&self, session: &str, _working_dir: &Path, _argv: &[String]) -> Result<(), ConsoleError> {
            self.launches.lock().unwrap().push(session.to_string());
            Ok(())
        }
    }
}
