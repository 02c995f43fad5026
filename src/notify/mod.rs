//! Outbound channel messages
//!
//! The core never talks to a chat service directly. Everything it wants an
//! operator to see becomes a [`ChannelMessage`] on one mpsc channel, and the
//! [`Dispatcher`] is the only place that delivers them.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::watchdog::WatchEvent;

/// Characters added by [`markdown`] around the body.
pub const MARKDOWN_OVERHEAD: usize = "```markdown\n\n```".len();

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub content: String,
}

impl ChannelMessage {
    pub fn new(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            content: content.into(),
        }
    }
}

pub type ChannelSender = mpsc::Sender<ChannelMessage>;
pub type ChannelReceiver = mpsc::Receiver<ChannelMessage>;

pub fn channel(capacity: usize) -> (ChannelSender, ChannelReceiver) {
    mpsc::channel(capacity)
}

/// Wraps text in a markdown code block.
pub fn markdown(text: &str) -> String {
    format!("```markdown\n{}\n```", text)
}

// ─── Delivery ────────────────────────────────────────────────

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

/// Delivers channel messages to webhooks, or to the log when a channel has none.
pub struct Dispatcher {
    client: reqwest::Client,
    webhooks: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(webhooks: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhooks,
        }
    }

    pub async fn deliver(&self, msg: &ChannelMessage) -> anyhow::Result<()> {
        let Some(url) = self.webhooks.get(&msg.channel) else {
            tracing::info!(channel = %msg.channel, "{}", msg.content);
            return Ok(());
        };

        self.client
            .post(url)
            .json(&WebhookPayload { content: &msg.content })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn deliver_logged(&self, msg: &ChannelMessage) {
        if let Err(e) = self.deliver(msg).await {
            tracing::warn!("Failed to deliver message to channel {}: {}", msg.channel, e);
        }
    }

    /// Runs until every sender is gone, or until `shutdown` fires.
    ///
    /// On shutdown the messages already queued are still delivered.
    pub fn spawn(self, mut rx: ChannelReceiver, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = shutdown.cancelled() => {
                        rx.close();
                        while let Some(msg) = rx.recv().await {
                            self.deliver_logged(&msg).await;
                        }
                        break;
                    }
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                self.deliver_logged(&msg).await;
            }
            tracing::info!("Channel dispatcher stopped");
        })
    }
}

// ─── Watch event pump ────────────────────────────────────────

/// Renders watchdog events into messages for the notification channel.
///
/// Multi-part notices (crash report chunks) are spaced by `chunk_delay`.
pub fn spawn_watch_pump(
    mut events: mpsc::Receiver<WatchEvent>,
    sink: ChannelSender,
    channel: String,
    chunk_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!("WD: event for {}: {:?}", event.server(), event);
            for (i, content) in event.render().into_iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(chunk_delay).await;
                }
                if sink.send(ChannelMessage::new(channel.clone(), content)).await.is_err() {
                    tracing::warn!("Channel sink closed, watch event pump exiting");
                    return;
                }
            }
        }
    })
}
