//! End-to-end tests against a relay bound on an ephemeral port.

use std::net::SocketAddr;
use std::time::Duration;

use chat_relay::{ChatServer, Registry, ServerConfig, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Start a server on 127.0.0.1:0 and return its address and registry
async fn start_server(config: ServerConfig) -> (SocketAddr, Registry) {
    let server = ChatServer::bind(ServerConfig {
        addr: "127.0.0.1:0".to_string(),
        ..config
    })
    .await
    .expect("Failed to bind server");
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    tokio::spawn(server.run());
    (addr, registry)
}

/// Test client speaking the line protocol
struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    /// Connect, join, and consume the joiner's own presence list
    async fn join(addr: SocketAddr, name: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send_line(&format!(r#"{{"kind":"join","from":"{}"}}"#, name))
            .await;
        match client.recv().await {
            ServerMessage::PresenceList { names, .. } => {
                assert!(names.iter().any(|n| n == name));
            }
            other => panic!("{} expected presence list, got {:?}", name, other),
        }
        client
    }

    async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        let line = timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("Timed out waiting for a line")
            .expect("Read failed")
            .expect("Stream closed");
        serde_json::from_str(&line).expect("Server sent invalid JSON")
    }

    /// Returns true if the server closes the stream
    async fn recv_eof(&mut self) -> bool {
        matches!(
            timeout(READ_TIMEOUT, self.lines.next_line()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }

    /// Asserts nothing arrives within the quiet period
    async fn assert_silent(&mut self) {
        if let Ok(line) = timeout(QUIET_PERIOD, self.lines.next_line()).await {
            panic!("Expected no message, got {:?}", line);
        }
    }

    /// Consume the system notice and presence list produced by a join/leave
    async fn skip_membership_change(&mut self) -> Vec<String> {
        assert!(matches!(self.recv().await, ServerMessage::System { .. }));
        match self.recv().await {
            ServerMessage::PresenceList { names, .. } => names,
            other => panic!("Expected presence list, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn chat_reaches_others_but_not_sender() {
    let (addr, _registry) = start_server(ServerConfig::default()).await;
    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;
    alice.skip_membership_change().await;

    alice.send_line(r#"{"kind":"chat","body":"hi"}"#).await;

    match bob.recv().await {
        ServerMessage::Chat { from, body, .. } => {
            assert_eq!(from, "alice");
            assert_eq!(body, "hi");
        }
        other => panic!("Expected chat, got {:?}", other),
    }
    alice.assert_silent().await;
}

#[tokio::test]
async fn server_overrides_client_identity() {
    let (addr, _registry) = start_server(ServerConfig::default()).await;
    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;
    alice.skip_membership_change().await;

    alice
        .send_line(r#"{"kind":"chat","from":"bob","timestamp":"2000-01-01T00:00:00Z","body":"forged"}"#)
        .await;

    match bob.recv().await {
        ServerMessage::Chat {
            from, timestamp, ..
        } => {
            assert_eq!(from, "alice");
            assert!(timestamp.to_rfc3339() > "2000-01-02".to_string());
        }
        other => panic!("Expected chat, got {:?}", other),
    }
}

#[tokio::test]
async fn join_notifies_others_with_sorted_presence() {
    let (addr, _registry) = start_server(ServerConfig::default()).await;
    let mut carol = TestClient::join(addr, "carol").await;
    let _alice = TestClient::join(addr, "alice").await;

    match carol.recv().await {
        ServerMessage::System { body, .. } => assert_eq!(body, "'alice' has joined the chat."),
        other => panic!("Expected join notice, got {:?}", other),
    }
    match carol.recv().await {
        ServerMessage::PresenceList { names, .. } => assert_eq!(names, vec!["alice", "carol"]),
        other => panic!("Expected presence list, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let (addr, registry) = start_server(ServerConfig::default()).await;
    let _alice = TestClient::join(addr, "alice").await;
    let first = registry.get("alice").unwrap().id();

    let mut imposter = TestClient::connect(addr).await;
    imposter
        .send_line(r#"{"kind":"join","from":"alice"}"#)
        .await;

    match imposter.recv().await {
        ServerMessage::Error { body, .. } => assert_eq!(body, "Username is already taken."),
        other => panic!("Expected error, got {:?}", other),
    }
    assert!(imposter.recv_eof().await);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get("alice").unwrap().id(), first);
}

#[tokio::test]
async fn malformed_handshake_closes_connection() {
    let (addr, registry) = start_server(ServerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.send_line("hello there").await;

    assert!(matches!(client.recv().await, ServerMessage::Error { .. }));
    assert!(client.recv_eof().await);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn whisper_reaches_target_and_echoes_to_sender() {
    let (addr, _registry) = start_server(ServerConfig::default()).await;
    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;
    let mut carol = TestClient::join(addr, "carol").await;
    alice.skip_membership_change().await;
    alice.skip_membership_change().await;
    bob.skip_membership_change().await;

    alice
        .send_line(r#"{"kind":"whisper","to":"bob","body":"hey"}"#)
        .await;

    let to_bob = bob.recv().await;
    let echo = alice.recv().await;
    assert_eq!(to_bob, echo);
    match to_bob {
        ServerMessage::Whisper { from, to, body, .. } => {
            assert_eq!(from, "alice");
            assert_eq!(to, "bob");
            assert_eq!(body, "hey");
        }
        other => panic!("Expected whisper, got {:?}", other),
    }
    carol.assert_silent().await;
}

#[tokio::test]
async fn whisper_to_unknown_user_errors_to_sender_only() {
    let (addr, _registry) = start_server(ServerConfig::default()).await;
    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;
    alice.skip_membership_change().await;

    alice
        .send_line(r#"{"kind":"whisper","to":"dave","body":"anyone?"}"#)
        .await;

    assert!(matches!(alice.recv().await, ServerMessage::Error { .. }));
    bob.assert_silent().await;
}

#[tokio::test]
async fn self_whisper_delivers_once() {
    let (addr, _registry) = start_server(ServerConfig::default()).await;
    let mut alice = TestClient::join(addr, "alice").await;

    alice
        .send_line(r#"{"kind":"whisper","to":"alice","body":"memo"}"#)
        .await;

    assert!(matches!(alice.recv().await, ServerMessage::Whisper { .. }));
    alice.assert_silent().await;
}

#[tokio::test]
async fn malformed_line_does_not_end_session() {
    let (addr, _registry) = start_server(ServerConfig::default()).await;
    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;
    alice.skip_membership_change().await;

    alice.send_line("{not json").await;
    alice.send_line(r#"{"kind":"presence-list","names":[]}"#).await;
    alice.send_line(r#"{"kind":"chat","body":"still here"}"#).await;

    match bob.recv().await {
        ServerMessage::Chat { body, .. } => assert_eq!(body, "still here"),
        other => panic!("Expected chat, got {:?}", other),
    }
}

#[tokio::test]
async fn invalid_utf8_line_does_not_end_session() {
    let (addr, registry) = start_server(ServerConfig::default()).await;
    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;
    alice.skip_membership_change().await;

    alice.send_bytes(b"{\"kind\":\"chat\",\"body\":\"\xff\"}\n").await;
    alice.send_line(r#"{"kind":"chat","body":"after"}"#).await;

    match bob.recv().await {
        ServerMessage::Chat { from, body, .. } => {
            assert_eq!(from, "alice");
            assert_eq!(body, "after");
        }
        other => panic!("Expected chat, got {:?}", other),
    }
    assert!(registry.contains("alice"));
}

#[tokio::test]
async fn overlong_line_does_not_end_session() {
    let (addr, registry) = start_server(ServerConfig {
        max_line_length: 64,
        ..ServerConfig::default()
    })
    .await;
    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;
    alice.skip_membership_change().await;

    alice
        .send_line(&format!(r#"{{"kind":"chat","body":"{}"}}"#, "x".repeat(200)))
        .await;
    alice.send_line(r#"{"kind":"chat","body":"short"}"#).await;

    match bob.recv().await {
        ServerMessage::Chat { body, .. } => assert_eq!(body, "short"),
        other => panic!("Expected chat, got {:?}", other),
    }
    assert!(registry.contains("alice"));
}

#[tokio::test]
async fn abrupt_disconnect_cleans_up() {
    let (addr, registry) = start_server(ServerConfig::default()).await;
    let mut alice = TestClient::join(addr, "alice").await;
    let bob = TestClient::join(addr, "bob").await;
    let mut carol = TestClient::join(addr, "carol").await;
    alice.skip_membership_change().await;
    alice.skip_membership_change().await;

    drop(bob);

    match alice.recv().await {
        ServerMessage::System { body, .. } => assert_eq!(body, "'bob' has left the chat."),
        other => panic!("Expected leave notice, got {:?}", other),
    }
    match alice.recv().await {
        ServerMessage::PresenceList { names, .. } => assert_eq!(names, vec!["alice", "carol"]),
        other => panic!("Expected presence list, got {:?}", other),
    }
    assert!(!registry.contains("bob"));

    carol.skip_membership_change().await;
    alice.send_line(r#"{"kind":"chat","body":"bye bob"}"#).await;
    match carol.recv().await {
        ServerMessage::Chat { body, .. } => assert_eq!(body, "bye bob"),
        other => panic!("Expected chat, got {:?}", other),
    }
}

#[tokio::test]
async fn name_reusable_after_leave() {
    let (addr, registry) = start_server(ServerConfig::default()).await;
    let mut watcher = TestClient::join(addr, "watcher").await;

    let alice = TestClient::join(addr, "alice").await;
    watcher.skip_membership_change().await;
    drop(alice);
    let names = watcher.skip_membership_change().await;
    assert_eq!(names, vec!["watcher"]);

    let _alice_again = TestClient::join(addr, "alice").await;
    assert!(registry.contains("alice"));
}

#[tokio::test]
async fn connection_ceiling_refuses_extra_clients() {
    let (addr, registry) = start_server(ServerConfig {
        max_connections: Some(1),
        ..ServerConfig::default()
    })
    .await;
    let _alice = TestClient::join(addr, "alice").await;

    let mut late = TestClient::connect(addr).await;
    match late.recv().await {
        ServerMessage::Error { body, .. } => assert_eq!(body, "Server is full."),
        other => panic!("Expected error, got {:?}", other),
    }
    assert!(late.recv_eof().await);
    assert_eq!(registry.names_sorted(), vec!["alice"]);
}

#[tokio::test]
async fn stalled_reader_releases_its_slot() {
    let (addr, registry) = start_server(ServerConfig {
        max_connections: Some(2),
        close_grace: Duration::from_millis(100),
        ..ServerConfig::default()
    })
    .await;
    // alice never reads, so her socket buffers fill and her writer blocks.
    let mut alice = TestClient::join(addr, "alice").await;
    let mut bob = TestClient::join(addr, "bob").await;

    let line = format!(r#"{{"kind":"chat","body":"{}"}}"#, "x".repeat(60_000));
    for _ in 0..400 {
        bob.send_line(&line).await;
    }
    tokio::time::sleep(QUIET_PERIOD).await;

    alice.writer.shutdown().await.unwrap();
    drop(bob);

    timeout(READ_TIMEOUT, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Sessions were not unregistered");

    // Both slots must come back once the grace period has run out.
    let joined = timeout(READ_TIMEOUT, async {
        loop {
            let mut carol = TestClient::connect(addr).await;
            carol.send_line(r#"{"kind":"join","from":"carol"}"#).await;
            match carol.recv().await {
                ServerMessage::PresenceList { names, .. } => return names,
                ServerMessage::Error { body, .. } if body == "Server is full." => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                other => panic!("Expected presence list, got {:?}", other),
            }
        }
    })
    .await
    .expect("Connection slot was never released");
    assert_eq!(joined, vec!["carol"]);
    drop(alice);
}
