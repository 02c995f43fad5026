//! Relay server over real TCP sockets.

use std::net::SocketAddr;
use std::time::Duration;

use mcwarden::notify::{self, ChannelMessage, ChannelReceiver};
use mcwarden::relay::bindings::BindingStore;
use mcwarden::relay::{RelayServer, RelaySettings};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr, handshake: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut writer) = stream.into_split();
        writer.write_all(handshake.as_bytes()).await.unwrap();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// `None` on EOF.
    async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        (n > 0).then_some(line)
    }

    async fn recv_nothing_for(&mut self, wait: Duration) -> bool {
        let mut line = String::new();
        tokio::time::timeout(wait, self.reader.read_line(&mut line)).await.is_err()
    }
}

fn relay(dir: &TempDir) -> (RelayServer, ChannelReceiver) {
    let (sink, rx) = notify::channel(64);
    let settings = RelaySettings {
        host: "127.0.0.1".to_string(),
        inqueue_capacity: 64,
        outqueue_capacity: 24,
        handshake_timeout: Duration::from_secs(2),
        max_line_bytes: 64 * 1024,
    };
    let store = BindingStore::load(dir.path().join("chatrelay.json")).unwrap();
    (RelayServer::new(settings, store, sink), rx)
}

async fn wait_for_clients(relay: &RelayServer, expected: &[&str]) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let clients = relay.status().await.clients;
        if expected.iter().all(|c| clients.iter().any(|n| n == c)) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "clients never connected: {:?}", clients);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Skips connect/disconnect notices until a message matching `pred` arrives.
async fn expect_message(rx: &mut ChannelReceiver, pred: impl Fn(&ChannelMessage) -> bool) -> ChannelMessage {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let msg = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for channel message")
            .expect("sink closed");
        if pred(&msg) {
            return msg;
        }
    }
}

#[tokio::test]
async fn bound_channel_gets_formatted_chat_and_peers_get_raw_line() {
    let dir = TempDir::new().unwrap();
    let (relay, mut rx) = relay(&dir);
    relay.register("clientA", "123").await.unwrap();
    let addr = relay.start(0).await.unwrap();

    let mut a = Client::connect(addr, "HSHK::clientA\n").await;
    let mut b = Client::connect(addr, "HSHK::clientB\n").await;
    wait_for_clients(&relay, &["clientA", "clientB"]).await;

    let connected = expect_message(&mut rx, |m| m.content.contains("clientA connected")).await;
    assert_eq!(connected.channel, "123");

    a.send("MSG::survival::Steve::hello world::\n").await;

    let line = b.recv().await.unwrap();
    assert_eq!(line, "MSG::survival::Steve::hello world::\n");

    let msg = expect_message(&mut rx, |m| !m.content.contains("connected")).await;
    assert_eq!(msg, ChannelMessage::new("123", "[**survival**] Steve: hello world"));

    // 자기 자신에게는 돌아오지 않는다
    assert!(a.recv_nothing_for(Duration::from_millis(200)).await);

    relay.stop().await;
}

#[tokio::test]
async fn unbound_client_and_unknown_kinds_reach_no_channel() {
    let dir = TempDir::new().unwrap();
    let (relay, mut rx) = relay(&dir);
    relay.register("clientA", "123").await.unwrap();
    let addr = relay.start(0).await.unwrap();

    let mut a = Client::connect(addr, "HSHK::clientA\n").await;
    let mut b = Client::connect(addr, "HSHK::clientB\n").await;
    wait_for_clients(&relay, &["clientA", "clientB"]).await;

    b.send("BOGUS::whatever::\n").await;
    b.send("DTH::creative::Alex::fell out of the world::\n").await;

    // 알 수 없는 종류는 버려지고 DTH만 A에게 전달된다
    assert_eq!(a.recv().await.unwrap(), "DTH::creative::Alex::fell out of the world::\n");
    // clientB는 바인딩이 없으므로 채널 메시지는 A의 접속 알림뿐
    assert!(tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            match rx.recv().await {
                Some(m) if m.content.contains("Alex") => return,
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .is_err());

    relay.stop().await;
}

#[tokio::test]
async fn channel_chat_is_escaped_and_sent_to_bound_clients() {
    let dir = TempDir::new().unwrap();
    let (relay, _rx) = relay(&dir);
    relay.register("clientA", "123").await.unwrap();
    relay.register("clientC", "456").await.unwrap();
    let addr = relay.start(0).await.unwrap();

    let mut a = Client::connect(addr, "HSHK::clientA\n").await;
    let mut c = Client::connect(addr, "HSHK::clientC\n").await;
    wait_for_clients(&relay, &["clientA", "clientC"]).await;

    let delivered = relay.relay_from_channel("123", "Bob", "hi::there\nsecond line").await;
    assert_eq!(delivered, 1);
    assert_eq!(
        a.recv().await.unwrap(),
        "MSG::Discord::Bob::hi:\\:there\\nsecond line::\n"
    );
    assert!(c.recv_nothing_for(Duration::from_millis(200)).await);

    relay.stop().await;
}

#[tokio::test]
async fn reconnect_replaces_stale_connection() {
    let dir = TempDir::new().unwrap();
    let (relay, _rx) = relay(&dir);
    let addr = relay.start(0).await.unwrap();

    let mut first = Client::connect(addr, "HSHK::clientA\n").await;
    wait_for_clients(&relay, &["clientA"]).await;
    let mut second = Client::connect(addr, "HSHK::clientA\n").await;

    // 이전 연결은 서버 쪽에서 닫힌다
    assert_eq!(first.recv().await, None);
    assert_eq!(relay.status().await.clients, vec!["clientA".to_string()]);

    let mut other = Client::connect(addr, "HSHK::clientB\n").await;
    wait_for_clients(&relay, &["clientB"]).await;
    other.send("SAY::creative::Server::restarting::\n").await;
    assert_eq!(second.recv().await.unwrap(), "SAY::creative::Server::restarting::\n");

    relay.stop().await;
}

#[tokio::test]
async fn malformed_handshake_uses_peer_address() {
    let dir = TempDir::new().unwrap();
    let (relay, _rx) = relay(&dir);
    let addr = relay.start(0).await.unwrap();

    let _client = Client::connect(addr, "HELLO\n").await;
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let clients = relay.status().await.clients;
        if clients.iter().any(|c| c.starts_with("127.0.0.1:")) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    relay.stop().await;
}

#[tokio::test]
async fn stop_disconnects_clients_and_closes_listener() {
    let dir = TempDir::new().unwrap();
    let (relay, _rx) = relay(&dir);
    let addr = relay.start(0).await.unwrap();

    let mut a = Client::connect(addr, "HSHK::clientA\n").await;
    wait_for_clients(&relay, &["clientA"]).await;

    assert!(relay.stop().await);
    assert_eq!(a.recv().await, None);
    assert!(TcpStream::connect(addr).await.is_err());
    assert!(relay.status().await.clients.is_empty());
    assert_eq!(relay.relay_from_channel("123", "Bob", "hi").await, 0);
}

#[tokio::test]
async fn oversized_line_is_dropped_and_connection_survives() {
    let dir = TempDir::new().unwrap();
    let (relay, _rx) = relay(&dir);
    let addr = relay.start(0).await.unwrap();

    let mut a = Client::connect(addr, "HSHK::clientA\n").await;
    let mut b = Client::connect(addr, "HSHK::clientB\n").await;
    wait_for_clients(&relay, &["clientA", "clientB"]).await;

    let flood = format!("MSG::survival::Steve::{}::\n", "A".repeat(256 * 1024));
    a.send(&flood).await;
    a.send("MSG::survival::Steve::still here::\n").await;

    assert_eq!(b.recv().await.unwrap(), "MSG::survival::Steve::still here::\n");
    assert_eq!(relay.status().await.clients, vec!["clientA".to_string(), "clientB".to_string()]);

    relay.stop().await;
}

#[tokio::test]
async fn stalled_client_does_not_hold_back_others() {
    let dir = TempDir::new().unwrap();
    let (relay, mut rx) = relay(&dir);
    relay.register("clientA", "123").await.unwrap();
    let addr = relay.start(0).await.unwrap();

    // stalled는 한 번도 읽지 않는다
    let _stalled = Client::connect(addr, "HSHK::stalled\n").await;
    let mut a = Client::connect(addr, "HSHK::clientA\n").await;
    let mut b = Client::connect(addr, "HSHK::clientB\n").await;
    wait_for_clients(&relay, &["stalled", "clientA", "clientB"]).await;

    // 소켓 버퍼를 넉넉히 넘길 만큼 보낸다
    let payload = "x".repeat(16 * 1024);
    for i in 0..300 {
        let line = format!("MSG::survival::Steve::{} {}::\n", i, payload);
        a.send(&line).await;
        assert_eq!(b.recv().await.unwrap(), line);
        let marker = format!("Steve: {} ", i);
        let msg = expect_message(&mut rx, |m| m.content.contains(&marker)).await;
        assert_eq!(msg.channel, "123");
    }

    let clients = relay.status().await.clients;
    assert!(clients.contains(&"stalled".to_string()));
    assert!(tokio::time::timeout(WAIT, relay.stop()).await.unwrap());
}

#[tokio::test]
async fn binding_conflict_survives_restart_of_store() {
    let dir = TempDir::new().unwrap();
    {
        let (relay, _rx) = relay(&dir);
        relay.register("clientA", "123").await.unwrap();
        assert!(relay.register("clientA", "456").await.is_err());
    }
    let (relay, _rx) = relay(&dir);
    let status = relay.status().await;
    assert_eq!(status.bindings.get("123"), Some(&vec!["clientA".to_string()]));
    assert!(!status.bindings.contains_key("456"));
}
