use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GlobalConfig {
    pub servers: ServersConfig,
    pub watchdog: WatchdogConfig,
    pub relay: RelayConfig,
    pub notify: NotifyConfig,
    pub ipc: IpcConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServersConfig {
    /// 서버 디렉토리들이 위치한 경로 (`<path>/<server>/crash-reports`)
    pub path: PathBuf,
    /// Pause between the stop announcement and the `stop` command.
    pub stop_delay_secs: u64,
    pub instances: HashMap<String, ServerInstance>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerInstance {
    /// 실행 커맨드 (예: "java -Xmx4G -jar survival.jar")
    pub invocation: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WatchdogConfig {
    pub alive_interval_secs: u64,
    pub gone_interval_secs: u64,
    pub settle_secs: u64,
    pub crash_grace_secs: u64,
    pub restart_delay_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub autostart: bool,
    pub bindings_file: PathBuf,
    pub inqueue_capacity: usize,
    pub outqueue_capacity: usize,
    pub handshake_timeout_secs: u64,
    /// Longer lines are discarded.
    pub max_line_bytes: usize,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NotifyConfig {
    /// Channel that receives watchdog notices.
    pub channel: String,
    pub chunk_delay_ms: u64,
    /// channel id -> webhook URL
    pub webhooks: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IpcConfig {
    pub listen: String,
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./servers"),
            stop_delay_secs: 5,
            instances: HashMap::new(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            alive_interval_secs: 20,
            gone_interval_secs: 60,
            settle_secs: 40,
            crash_grace_secs: 60,
            restart_delay_secs: 90,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25580,
            autostart: false,
            bindings_file: PathBuf::from("config/chatrelay.json"),
            inqueue_capacity: 64,
            outqueue_capacity: 24,
            handshake_timeout_secs: 10,
            max_line_bytes: 8192,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel: "watchdog".to_string(),
            chunk_delay_ms: 1000,
            webhooks: HashMap::new(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:57480".to_string(),
        }
    }
}

impl GlobalConfig {
    /// Loads the config file; a missing file means all defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        Self::from_toml(&s).map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

impl ServersConfig {
    pub fn stop_delay(&self) -> Duration {
        Duration::from_secs(self.stop_delay_secs)
    }
}

impl RelayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl NotifyConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}
