//! Persisted client ↔ channel bindings
//!
//! A client is bound to at most one channel, a channel may serve many
//! clients. Every mutation is written to disk before it is acknowledged;
//! writes go through `tokio::fs` so a save never stalls a runtime worker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("{client} is already registered with channel {channel}")]
    AlreadyBound { client: String, channel: String },

    #[error("{0} is not registered with any channel")]
    NotBound(String),

    #[error("bindings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bindings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bindings {
    #[serde(default)]
    pub channel_to_clients: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub client_to_channel: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct BindingStore {
    path: PathBuf,
    data: Bindings,
}

impl BindingStore {
    /// Loads the file, or starts empty when it does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BindingError> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("CR: No bindings file at {}, starting empty", path.display());
                Bindings::default()
            }
            Err(source) => return Err(BindingError::Io { path, source }),
        };
        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channel_of(&self, client: &str) -> Option<&str> {
        self.data.client_to_channel.get(client).map(String::as_str)
    }

    pub fn clients_of(&self, channel: &str) -> &[String] {
        self.data
            .channel_to_clients
            .get(channel)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Bindings {
        self.data.clone()
    }

    /// `Ok(true)` for a new binding, `Ok(false)` if it already existed.
    pub async fn register(&mut self, client: &str, channel: &str) -> Result<bool, BindingError> {
        if let Some(existing) = self.channel_of(client) {
            if existing == channel {
                return Ok(false);
            }
            return Err(BindingError::AlreadyBound {
                client: client.to_string(),
                channel: existing.to_string(),
            });
        }

        self.mutate(|data| {
            data.client_to_channel.insert(client.to_string(), channel.to_string());
            data.channel_to_clients
                .entry(channel.to_string())
                .or_default()
                .push(client.to_string());
        })
        .await?;
        tracing::info!("CR: Registered {} with channel {}", client, channel);
        Ok(true)
    }

    /// Removes the binding and returns the channel it pointed at.
    pub async fn unregister(&mut self, client: &str) -> Result<String, BindingError> {
        let channel = self
            .channel_of(client)
            .ok_or_else(|| BindingError::NotBound(client.to_string()))?
            .to_string();

        self.mutate(|data| {
            data.client_to_channel.remove(client);
            if let Some(clients) = data.channel_to_clients.get_mut(&channel) {
                clients.retain(|c| c != client);
                if clients.is_empty() {
                    data.channel_to_clients.remove(&channel);
                }
            } else {
                tracing::error!("CR: Relay mapping inconsistency detected for {}!", client);
            }
        })
        .await?;
        tracing::info!("CR: Unregistered {} from channel {}", client, channel);
        Ok(channel)
    }

    /// Applies `f`, saves, and rolls back the in-memory change if saving fails.
    async fn mutate(&mut self, f: impl FnOnce(&mut Bindings)) -> Result<(), BindingError> {
        let before = self.data.clone();
        f(&mut self.data);
        if let Err(e) = self.save().await {
            self.data = before;
            return Err(e);
        }
        Ok(())
    }

    async fn save(&self) -> Result<(), BindingError> {
        let io_err = |source| BindingError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let content = serde_json::to_string_pretty(&self.data)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> BindingStore {
        BindingStore::load(dir.path().join("chatrelay.json")).unwrap()
    }

    #[tokio::test]
    async fn test_register_persists_both_maps() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        assert!(s.register("survival", "123").await.unwrap());
        assert!(s.register("creative", "123").await.unwrap());

        let reloaded = store(&dir);
        assert_eq!(reloaded.channel_of("survival"), Some("123"));
        assert_eq!(reloaded.clients_of("123"), &["survival", "creative"]);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(s.path()).unwrap()).unwrap();
        assert_eq!(raw["client_to_channel"]["creative"], "123");
        assert!(!dir.path().join("chatrelay.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_conflict_keeps_original_binding() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        s.register("survival", "123").await.unwrap();

        assert!(!s.register("survival", "123").await.unwrap());
        let err = s.register("survival", "456").await.unwrap_err();
        assert!(matches!(err, BindingError::AlreadyBound { ref channel, .. } if channel == "123"));
        assert_eq!(s.channel_of("survival"), Some("123"));
        assert!(s.clients_of("456").is_empty());
        assert_eq!(store(&dir).channel_of("survival"), Some("123"));
    }

    #[tokio::test]
    async fn test_unregister() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        s.register("survival", "123").await.unwrap();
        assert_eq!(s.unregister("survival").await.unwrap(), "123");
        assert!(matches!(s.unregister("survival").await, Err(BindingError::NotBound(_))));
        assert_eq!(store(&dir).snapshot(), Bindings::default());
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back() {
        let dir = TempDir::new().unwrap();
        // 저장 경로가 디렉토리라 rename이 실패한다
        let path = dir.path().join("taken");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();
        let mut s = BindingStore {
            path,
            data: Bindings::default(),
        };

        assert!(matches!(s.register("survival", "123").await, Err(BindingError::Io { .. })));
        assert_eq!(s.channel_of("survival"), None);
        assert!(s.clients_of("123").is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_registrations_all_persist() {
        let dir = TempDir::new().unwrap();
        let shared = std::sync::Arc::new(tokio::sync::RwLock::new(store(&dir)));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let shared = shared.clone();
            tasks.spawn(async move {
                let client = format!("server{}", i);
                shared.write().await.register(&client, "123").await.unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let reloaded = store(&dir);
        assert_eq!(reloaded.clients_of("123").len(), 8);
        assert!(!dir.path().join("chatrelay.json.tmp").exists());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatrelay.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(BindingStore::load(&path), Err(BindingError::Json(_))));
    }
}
