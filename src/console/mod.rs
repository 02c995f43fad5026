//! Server console access through a terminal multiplexer session.
//!
//! Every server runs inside a detached session named after it; starting,
//! stopping and console commands are all lines pushed into that session.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ServersConfig;

/// Announcement sent before `stop`.
const STOP_SEQUENCE: &[&str] = &[
    "title @a times 20 40 20",
    r#"title @a title {"text":"STOPPING SERVER NOW", "bold":true, "italic":true}"#,
    "broadcast Stopping now!",
    "save-all",
];

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("'{0}' is not a configured server")]
    UnknownServer(String),

    #[error("invocation for '{0}' is empty")]
    EmptyInvocation(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: String },
}

/// Side-effecting line channel into a named session.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Types `line` into the session and waits for the helper to finish.
    async fn send_line(&self, session: &str, line: &str) -> Result<(), ConsoleError>;

    /// Starts a detached session running `argv` in `working_dir`.
    async fn launch(&self, session: &str, working_dir: &Path, argv: &[String]) -> Result<(), ConsoleError>;
}

/// GNU screen backed channel.
#[derive(Debug, Clone)]
pub struct ScreenChannel {
    program: String,
}

impl Default for ScreenChannel {
    fn default() -> Self {
        Self {
            program: "screen".to_string(),
        }
    }
}

impl ScreenChannel {
    async fn run(&self, cmd: &mut Command) -> Result<(), ConsoleError> {
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| ConsoleError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(ConsoleError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CommandChannel for ScreenChannel {
    async fn send_line(&self, session: &str, line: &str) -> Result<(), ConsoleError> {
        tracing::info!("Sending \"{}\" to {}", line, session);
        let mut cmd = Command::new(&self.program);
        cmd.args(["-S", session, "-X", "stuff"]).arg(format!("{}\r", line));
        self.run(&mut cmd).await
    }

    async fn launch(&self, session: &str, working_dir: &Path, argv: &[String]) -> Result<(), ConsoleError> {
        tracing::info!("Launching session {} in {}", session, working_dir.display());
        let mut cmd = Command::new(&self.program);
        cmd.args(["-h", "5000", "-dmS", session])
            .args(argv)
            .current_dir(working_dir);
        self.run(&mut cmd).await
    }
}

/// Start/stop/console operations for configured servers.
pub struct ServerConsole {
    channel: Arc<dyn CommandChannel>,
    servers: ServersConfig,
}

impl ServerConsole {
    pub fn new(channel: Arc<dyn CommandChannel>, servers: ServersConfig) -> Self {
        Self { channel, servers }
    }

    pub fn is_configured(&self, server: &str) -> bool {
        self.servers.instances.contains_key(server)
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.servers.instances.keys().map(String::as_str)
    }

    fn ensure_configured(&self, server: &str) -> Result<(), ConsoleError> {
        if self.is_configured(server) {
            Ok(())
        } else {
            Err(ConsoleError::UnknownServer(server.to_string()))
        }
    }

    /// Launches the configured invocation inside `<servers>/<server>`.
    pub async fn start(&self, server: &str) -> Result<(), ConsoleError> {
        let instance = self
            .servers
            .instances
            .get(server)
            .ok_or_else(|| ConsoleError::UnknownServer(server.to_string()))?;

        let mut argv: Vec<String> = instance
            .invocation
            .split_whitespace()
            .map(String::from)
            .collect();
        if argv.is_empty() {
            return Err(ConsoleError::EmptyInvocation(server.to_string()));
        }
        argv.push("nogui".to_string());

        let working_dir = self.servers.path.join(server);
        tracing::info!("Starting {}", server);
        self.channel.launch(server, &working_dir, &argv).await
    }

    /// Announces the shutdown, saves, then sends `stop`.
    pub async fn stop(&self, server: &str) -> Result<(), ConsoleError> {
        self.ensure_configured(server)?;
        for line in STOP_SEQUENCE {
            self.channel.send_line(server, line).await?;
        }
        tokio::time::sleep(self.servers.stop_delay()).await;
        self.channel.send_line(server, "stop").await
    }

    pub async fn send(&self, server: &str, command: &str) -> Result<(), ConsoleError> {
        self.ensure_configured(server)?;
        self.channel.send_line(server, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerInstance;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        lines: Mutex<Vec<(String, String)>>,
        launches: Mutex<Vec<(String, PathBuf, Vec<String>)>>,
    }

    #[async_trait]
    impl CommandChannel for RecordingChannel {
        async fn send_line(&self, session: &str, line: &str) -> Result<(), ConsoleError> {
            self.lines.lock().unwrap().push((session.to_string(), line.to_string()));
            Ok(())
        }

        async fn launch(&self, session: &str, working_dir: &Path, argv: &[String]) -> Result<(), ConsoleError> {
            self.launches
                .lock()
                .unwrap()
                .push((session.to_string(), working_dir.to_path_buf(), argv.to_vec()));
            Ok(())
        }
    }

    fn servers() -> ServersConfig {
        let mut cfg = ServersConfig {
            path: PathBuf::from("/srv/mc"),
            stop_delay_secs: 0,
            ..Default::default()
        };
        cfg.instances.insert(
            "survival".to_string(),
            ServerInstance {
                invocation: "java -Xmx4G -jar survival.jar".to_string(),
            },
        );
        cfg.instances.insert(
            "broken".to_string(),
            ServerInstance {
                invocation: "   ".to_string(),
            },
        );
        cfg
    }

    #[tokio::test]
    async fn test_start_launches_invocation_in_server_dir() {
        let channel = Arc::new(RecordingChannel::default());
        let console = ServerConsole::new(channel.clone(), servers());

        console.start("survival").await.unwrap();

        let launches = channel.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        let (session, dir, argv) = &launches[0];
        assert_eq!(session, "survival");
        assert_eq!(dir, &PathBuf::from("/srv/mc/survival"));
        assert_eq!(argv, &["java", "-Xmx4G", "-jar", "survival.jar", "nogui"]);
    }

    #[tokio::test]
    async fn test_start_unknown_or_empty() {
        let console = ServerConsole::new(Arc::new(RecordingChannel::default()), servers());
        assert!(matches!(console.start("creative").await, Err(ConsoleError::UnknownServer(_))));
        assert!(matches!(console.start("broken").await, Err(ConsoleError::EmptyInvocation(_))));
    }

    #[tokio::test]
    async fn test_stop_sends_announcement_then_stop() {
        let channel = Arc::new(RecordingChannel::default());
        let console = ServerConsole::new(channel.clone(), servers());

        console.stop("survival").await.unwrap();

        let lines = channel.lines.lock().unwrap();
        assert_eq!(lines.len(), STOP_SEQUENCE.len() + 1);
        assert!(lines.iter().all(|(s, _)| s == "survival"));
        assert_eq!(lines[3].1, "save-all");
        assert_eq!(lines.last().unwrap().1, "stop");
    }

    #[tokio::test]
    async fn test_send_requires_configured_server() {
        let channel = Arc::new(RecordingChannel::default());
        let console = ServerConsole::new(channel.clone(), servers());
        assert!(console.send("creative", "list").await.is_err());
        console.send("survival", "list").await.unwrap();
        assert_eq!(channel.lines.lock().unwrap()[0].1, "list");
    }
}
