//! Chat relay server
//!
//! Game servers connect over TCP and exchange protocol lines. Incoming lines
//! from every client funnel into one bounded inbound queue; a single consumer
//! fans them out to the other clients' outbound queues and to the channel the
//! source client is bound to.

pub mod bindings;
pub mod protocol;
pub mod queue;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::notify::{markdown, ChannelMessage, ChannelSender};
use bindings::{BindingError, BindingStore};
use protocol::{MessageKind, RelayMessage, CHAT_PRIORITY};
use queue::{OutboundQueue, PushError};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay server is already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("failed to bind relay server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub host: String,
    pub inqueue_capacity: usize,
    pub outqueue_capacity: usize,
    pub handshake_timeout: Duration,
    pub max_line_bytes: usize,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(cfg: &RelayConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            inqueue_capacity: cfg.inqueue_capacity.max(1),
            outqueue_capacity: cfg.outqueue_capacity.max(1),
            handshake_timeout: cfg.handshake_timeout(),
            max_line_bytes: cfg.max_line_bytes.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered { client_connected: bool },
    AlreadyRegistered,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub online: bool,
    pub address: Option<SocketAddr>,
    pub clients: Vec<String>,
    /// channel -> clients
    pub bindings: BTreeMap<String, Vec<String>>,
}

impl RelayStatus {
    pub fn render(&self) -> String {
        let mut info = vec!["# Chat Relay Status:".to_string()];
        match self.address {
            Some(addr) if self.online => info.push(format!("\n# Relay server is online on {}.\n", addr)),
            _ => info.push("\n< Relay server is offline! >\n".to_string()),
        }
        if !self.clients.is_empty() {
            info.push("\n# Currently connected clients:".to_string());
            info.extend(self.clients.iter().map(|c| format!("- {}", c)));
        }
        if !self.bindings.is_empty() {
            info.push("\n# Relay configuration:".to_string());
            for (channel, clients) in &self.bindings {
                info.push(format!("{}:", channel));
                info.extend(clients.iter().map(|c| format!("- {}", c)));
            }
        }
        if self.clients.is_empty() && self.bindings.is_empty() {
            info.push("> No clients connected, nothing configured.".to_string());
        }
        info.join("\n")
    }
}

/// Registry entry for one live connection.
struct ClientHandle {
    conn_id: u64,
    queue: Arc<OutboundQueue>,
    cancel: CancellationToken,
}

/// (client name, raw line)
type Inbound = (String, String);

/// State shared by the accept loop, connections and the consumer.
struct RelayShared {
    settings: RelaySettings,
    bindings: RwLock<BindingStore>,
    sink: ChannelSender,
    clients: Mutex<HashMap<String, ClientHandle>>,
    next_conn_id: AtomicU64,
}

struct RunningRelay {
    addr: SocketAddr,
    cancel: CancellationToken,
    acceptor: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

pub struct RelayServer {
    shared: Arc<RelayShared>,
    running: Mutex<Option<RunningRelay>>,
}

impl RelayServer {
    pub fn new(settings: RelaySettings, bindings: BindingStore, sink: ChannelSender) -> Self {
        Self {
            shared: Arc::new(RelayShared {
                settings,
                bindings: RwLock::new(bindings),
                sink,
                clients: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
            }),
            running: Mutex::new(None),
        }
    }

    /// Binds `host:port` and starts accepting. Port 0 picks a free port.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, RelayError> {
        let mut running = self.running.lock().await;
        if let Some(relay) = running.as_ref() {
            tracing::warn!("CR: Server already established!");
            return Err(RelayError::AlreadyRunning(relay.addr));
        }

        let bind_addr = format!("{}:{}", self.shared.settings.host, port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|source| RelayError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;
        let addr = listener.local_addr().map_err(|source| RelayError::Bind {
            addr: bind_addr,
            source,
        })?;

        let cancel = CancellationToken::new();
        let (inq_tx, inq_rx) = mpsc::channel(self.shared.settings.inqueue_capacity);
        let consumer = tokio::spawn(inqueue_worker(self.shared.clone(), inq_rx, cancel.clone()));
        let acceptor = tokio::spawn(accept_loop(self.shared.clone(), listener, inq_tx, cancel.clone()));

        tracing::info!("CR: Server started on {}!", addr);
        *running = Some(RunningRelay {
            addr,
            cancel,
            acceptor,
            consumer,
        });
        Ok(addr)
    }

    /// Closes the listener and disconnects every client. `false` if not running.
    pub async fn stop(&self) -> bool {
        let Some(relay) = self.running.lock().await.take() else {
            tracing::info!("CR: No server to be closed.");
            return false;
        };

        relay.cancel.cancel();
        for (_, client) in self.shared.clients.lock().await.drain() {
            client.cancel.cancel();
            client.queue.close();
        }
        if let Err(e) = relay.acceptor.await {
            tracing::warn!("CR: Accept loop did not exit cleanly: {}", e);
        }
        if let Err(e) = relay.consumer.await {
            tracing::warn!("CR: Inqueue worker did not exit cleanly: {}", e);
        }
        tracing::info!("CR: Server closed!");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn status(&self) -> RelayStatus {
        let address = self.running.lock().await.as_ref().map(|r| r.addr);
        let mut clients: Vec<String> = self.shared.clients.lock().await.keys().cloned().collect();
        clients.sort();
        let bindings = self.shared.bindings.read().await.snapshot().channel_to_clients;
        RelayStatus {
            online: address.is_some(),
            address,
            clients,
            bindings,
        }
    }

    pub async fn register(&self, client: &str, channel: &str) -> Result<RegisterOutcome, BindingError> {
        let created = self.shared.bindings.write().await.register(client, channel).await?;
        if !created {
            return Ok(RegisterOutcome::AlreadyRegistered);
        }
        let client_connected = self.shared.clients.lock().await.contains_key(client);
        Ok(RegisterOutcome::Registered { client_connected })
    }

    /// Returns the channel the client was bound to.
    pub async fn unregister(&self, client: &str) -> Result<String, BindingError> {
        self.shared.bindings.write().await.unregister(client).await
    }

    /// Forwards chat typed in `channel` to every connected client bound to it.
    ///
    /// Returns how many clients accepted the line.
    pub async fn relay_from_channel(&self, channel: &str, author: &str, content: &str) -> usize {
        if !self.is_running().await || content.trim().is_empty() {
            return 0;
        }

        let line = protocol::channel_chat(author, content);
        let targets: Vec<String> = self.shared.bindings.read().await.clients_of(channel).to_vec();
        let clients = self.shared.clients.lock().await;
        targets
            .iter()
            .filter_map(|name| clients.get(name))
            .filter(|client| client.queue.try_push(CHAT_PRIORITY, line.clone()).is_ok())
            .count()
    }
}

// ─── Connections ─────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Eof,
    Line,
    /// Over the cap; the rest of the line was skipped and `buf` is empty.
    TooLong,
}

/// `read_until(b'\n')` that never buffers more than `max + 1` bytes.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max as u64 + 1;
    buf.clear();
    if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') || buf.len() <= max {
        return Ok(LineRead::Line);
    }

    // 줄 끝까지 버린다
    loop {
        buf.clear();
        let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
        if n == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    buf.clear();
    Ok(LineRead::TooLong)
}

async fn accept_loop(
    shared: Arc<RelayShared>,
    listener: TcpListener,
    inqueue: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(connection_handler(
                        shared.clone(),
                        stream,
                        peer,
                        inqueue.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => tracing::warn!("CR-Connection: Accept failed: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

fn notify_inqueue(inqueue: &mpsc::Sender<Inbound>, client: &str, text: String) {
    if inqueue
        .try_send((client.to_string(), protocol::system_notice(&markdown(&text))))
        .is_err()
    {
        tracing::debug!("CR-Connection: Incoming queue unavailable, notice for {} dropped", client);
    }
}

async fn connection_handler(
    shared: Arc<RelayShared>,
    stream: TcpStream,
    peer: SocketAddr,
    inqueue: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    tracing::info!("CR-Connection: New connection established with {}!", peer);
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut first = Vec::new();
    let max_line = shared.settings.max_line_bytes;
    let read = tokio::select! {
        _ = cancel.cancelled() => return,
        r = tokio::time::timeout(
            shared.settings.handshake_timeout,
            read_line_capped(&mut reader, &mut first, max_line),
        ) => r,
    };
    match read {
        Ok(Ok(LineRead::Line)) => {}
        Ok(Ok(LineRead::TooLong)) => {
            tracing::warn!("CR-Connection: Handshake from {} exceeds {} bytes!", peer, max_line);
        }
        Ok(Ok(LineRead::Eof)) => {
            tracing::warn!("CR-Connection: No handshake from {} received! Connection shutting down!", peer);
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!("CR-Connection: Handshake read from {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            tracing::warn!("CR-Connection: Handshake from {} timed out! Connection shutting down!", peer);
            return;
        }
    }

    let handshake = String::from_utf8_lossy(&first);
    let client = match protocol::parse_handshake(&handshake) {
        Some(name) => name,
        None => {
            tracing::warn!("CR-Connection: Invalid handshake: {}", handshake.trim_end());
            tracing::warn!("CR-Connection: Using client address as name.");
            peer.to_string()
        }
    };
    notify_inqueue(&inqueue, &client, format!("# {} connected!", client));

    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let queue = Arc::new(OutboundQueue::new(shared.settings.outqueue_capacity));
    {
        let mut clients = shared.clients.lock().await;
        let handle = ClientHandle {
            conn_id,
            queue: queue.clone(),
            cancel: cancel.clone(),
        };
        if let Some(stale) = clients.insert(client.clone(), handle) {
            tracing::warn!("CR-Connection: {} reconnecting after messy exit, cleaning up!", client);
            stale.cancel.cancel();
            stale.queue.close();
        }
    }

    // 먼저 끝난 쪽이 나머지를 취소
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = incoming_worker(&mut reader, &client, &inqueue, max_line) => {}
        _ = outgoing_worker(&mut writer, &client, &queue) => {}
    }

    let left = queue.close();
    {
        let mut clients = shared.clients.lock().await;
        if clients.get(&client).map_or(false, |c| c.conn_id == conn_id) {
            clients.remove(&client);
            tracing::info!("CR-Connection: Outqueue for {} removed with {} items.", client, left);
        }
    }

    let _ = writer.shutdown().await;
    tracing::info!("CR-Connection: Connection with {} closed!", client);
    notify_inqueue(&inqueue, &client, format!("< {} disconnected! >", client));
}

async fn incoming_worker(
    reader: &mut BufReader<OwnedReadHalf>,
    client: &str,
    inqueue: &mpsc::Sender<Inbound>,
    max_line: usize,
) {
    tracing::info!("CR-Incoming: Worker for {} started.", client);
    let mut buf = Vec::new();
    loop {
        match read_line_capped(reader, &mut buf, max_line).await {
            Ok(LineRead::Eof) => {
                tracing::info!("CR-Incoming: {} appears to have disconnected!", client);
                break;
            }
            Ok(LineRead::Line) => {}
            Ok(LineRead::TooLong) => {
                tracing::warn!("CR-Incoming: Line from {} exceeds {} bytes, dropped!", client, max_line);
                continue;
            }
            Err(e) => {
                tracing::warn!("CR-Incoming: Read from {} failed: {}", client, e);
                break;
            }
        }

        let line = match String::from_utf8(buf.clone()) {
            Ok(line) => line,
            Err(e) => {
                tracing::info!("CR-Incoming: {}", e);
                continue;
            }
        };
        match inqueue.try_send((client.to_string(), line)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("CR-Incoming: Incoming queue full, message dropped!");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    tracing::info!("CR-Incoming: Worker for {} exited.", client);
}

async fn outgoing_worker(writer: &mut OwnedWriteHalf, client: &str, queue: &OutboundQueue) {
    tracing::info!("CR-Outgoing: Worker for {} started.", client);
    while let Some(item) = queue.pop().await {
        let result = async {
            writer.write_all(item.line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("CR-Outgoing: Write to {} failed: {}", client, e);
            break;
        }
    }
    tracing::info!("CR-Outgoing: Worker for {} exited.", client);
}

// ─── Inbound consumer ────────────────────────────────────────

async fn inqueue_worker(shared: Arc<RelayShared>, mut inqueue: mpsc::Receiver<Inbound>, cancel: CancellationToken) {
    tracing::info!("CR-Inqueue: Worker started!");
    loop {
        let (client, line) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inqueue.recv() => match next {
                Some(item) => item,
                None => break,
            },
        };
        dispatch_inbound(&shared, &client, &line).await;
    }
    tracing::info!("CR-Inqueue: Worker exited.");
}

async fn dispatch_inbound(shared: &RelayShared, client: &str, line: &str) {
    let kind = match protocol::kind_of(line) {
        Ok(kind) => kind,
        Err(_) => {
            tracing::debug!("CR-Inqueue: Data from {} with invalid format: {}", client, line.trim_end());
            return;
        }
    };

    if kind != MessageKind::System {
        let clients = shared.clients.lock().await;
        for (name, other) in clients.iter() {
            if name == client {
                continue;
            }
            if let Err(PushError::Full) = other.queue.try_push(CHAT_PRIORITY, line) {
                tracing::debug!("CR-Inqueue: Outqueue for {} full, dropped", name);
            }
        }
    }

    let channel = match shared.bindings.read().await.channel_of(client) {
        Some(channel) => channel.to_string(),
        None => {
            tracing::debug!("CR-Inqueue: No channel for: \"{} : {}\", dropping!", client, line.trim_end());
            return;
        }
    };

    let text = match RelayMessage::parse(line) {
        Ok(msg) => msg.render(),
        Err(e) => {
            tracing::debug!("CR-Inqueue: {}: {}", e, line.trim_end());
            return;
        }
    };
    if shared.sink.send(ChannelMessage::new(channel, text)).await.is_err() {
        tracing::warn!("CR-Inqueue: {} message from {} could not be sent, sink closed", kind.tag(), client);
    }
}
