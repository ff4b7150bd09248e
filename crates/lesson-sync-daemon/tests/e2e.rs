//! End-to-end tests for lesson-sync-daemon.
//!
//! Real sockets on loopback: two services exchanging lessons, raw clients
//! poking at the wire format, and orchestrators finding each other through
//! the in-process discovery provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lesson_sync_core::{InMemoryDiscovery, Lesson, LessonMetadata, SyncEvent, SyncMessage};
use lesson_sync_daemon::{
    LessonSyncService, Mode, OrchestratorError, SessionOrchestrator, SyncConfig, SyncError,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

/// Long enough for a full exchange on loopback to have happened.
const SETTLE: Duration = Duration::from_millis(300);

fn prefs(topics: &[&str]) -> Vec<String> {
    topics.iter().map(|t| t.to_string()).collect()
}

/// Service whose new-lessons batches land in a channel.
fn service_with_channel() -> (LessonSyncService, mpsc::UnboundedReceiver<Vec<Lesson>>) {
    let service = LessonSyncService::default();
    let (tx, rx) = mpsc::unbounded_channel();
    service.on_new_lessons(move |lessons| {
        let _ = tx.send(lessons);
    });
    (service, rx)
}

/// Raw client that reads and writes protocol lines.
struct TestPeer {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    write: tokio::net::tcp::OwnedWriteHalf,
}

impl TestPeer {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("Failed to connect");
        let (read, write) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn recv(&mut self) -> SyncMessage {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .expect("Timed out waiting for message")
            .expect("Read failed")
            .expect("Connection closed");
        SyncMessage::decode(line.as_bytes()).expect("Undecodable line")
    }

    async fn expect_handshake(&mut self) -> Vec<LessonMetadata> {
        assert!(matches!(self.recv().await, SyncMessage::Username(_)));
        let metadata = match self.recv().await {
            SyncMessage::Metadata(metadata) => metadata,
            other => panic!("Expected METADATA, got {:?}", other),
        };
        assert!(matches!(self.recv().await, SyncMessage::Preferences(_)));
        metadata
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.expect("Write failed");
    }
}

// ==================== Two services ====================

#[tokio::test]
async fn test_client_pulls_preferred_lesson_from_server() {
    let (server, mut server_rx) = service_with_channel();
    let addr = server
        .start_server(0, vec![Lesson::new("Intro", "2", "0")], prefs(&["2"]), "A")
        .await
        .unwrap();

    let (client, mut client_rx) = service_with_channel();
    client
        .connect_as_client("127.0.0.1", addr.port(), vec![], prefs(&["2"]), "B")
        .await
        .unwrap();

    let batch = timeout(WAIT, client_rx.recv()).await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].metadata(), LessonMetadata::new("2", "0"));
    assert_eq!(batch[0].title, "Intro");
    assert_eq!(batch[0].source.as_deref(), Some("A"));
    assert!(batch[0].received_at.is_some());

    // Exactly once on B, never on A
    sleep(SETTLE).await;
    assert!(client_rx.try_recv().is_err());
    assert!(server_rx.try_recv().is_err());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unwanted_topic_never_delivered() {
    let (server, _server_rx) = service_with_channel();
    let addr = server
        .start_server(0, vec![Lesson::new("Optics", "9", "0")], prefs(&["9"]), "A")
        .await
        .unwrap();

    let (client, mut client_rx) = service_with_channel();
    client
        .connect_as_client("127.0.0.1", addr.port(), vec![], prefs(&["2"]), "B")
        .await
        .unwrap();

    sleep(SETTLE).await;
    assert!(client_rx.try_recv().is_err());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_server_pulls_from_client_too() {
    let (server, mut server_rx) = service_with_channel();
    let addr = server
        .start_server(0, vec![], prefs(&["0"]), "A")
        .await
        .unwrap();

    let (client, _client_rx) = service_with_channel();
    client
        .connect_as_client(
            "127.0.0.1",
            addr.port(),
            vec![Lesson::new("Learn how to code", "0", "0")],
            prefs(&[]),
            "B",
        )
        .await
        .unwrap();

    let batch = timeout(WAIT, server_rx.recv()).await.unwrap().unwrap();
    assert_eq!(batch[0].source.as_deref(), Some("B"));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_inbound_sessions_are_independent() {
    let (server, _server_rx) = service_with_channel();
    let addr = server
        .start_server(0, vec![Lesson::new("Intro", "2", "0")], prefs(&["2"]), "A")
        .await
        .unwrap();

    let mut clients = Vec::new();
    for name in ["B", "C", "D"] {
        let (client, rx) = service_with_channel();
        client
            .connect_as_client("127.0.0.1", addr.port(), vec![], prefs(&["2"]), name)
            .await
            .unwrap();
        clients.push((client, rx));
    }

    // Each client gets its own copy; one session serving doesn't consume it
    for (_, rx) in clients.iter_mut() {
        let batch = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(batch[0].source.as_deref(), Some("A"));
    }
    assert_eq!(server.session_count(), 3);

    for (client, _) in &clients {
        client.shutdown().await;
    }
    server.shutdown().await;
    assert_eq!(server.session_count(), 0);
}

// ==================== Wire format ====================

#[tokio::test]
async fn test_handshake_order_and_request_reply() {
    let server = LessonSyncService::default();
    let addr = server
        .start_server(
            0,
            vec![Lesson::new("Intro", "2", "0"), Lesson::new("Optics", "9", "0")],
            prefs(&["2"]),
            "A",
        )
        .await
        .unwrap();

    let mut peer = TestPeer::connect(addr.port()).await;
    assert_eq!(peer.recv().await, SyncMessage::Username("A".into()));
    assert_eq!(
        peer.recv().await,
        SyncMessage::Metadata(vec![
            LessonMetadata::new("2", "0"),
            LessonMetadata::new("9", "0")
        ])
    );
    assert_eq!(peer.recv().await, SyncMessage::Preferences(prefs(&["2"])));

    peer.send_raw(&SyncMessage::LessonRequest(LessonMetadata::new("9", "0")).to_line())
        .await;
    match peer.recv().await {
        SyncMessage::LessonData(lessons) => {
            assert_eq!(lessons.len(), 1);
            assert_eq!(lessons[0].title, "Optics");
            assert_eq!(lessons[0].source.as_deref(), Some("A"));
        }
        other => panic!("Expected LESSON_DATA, got {:?}", other),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_single_byte_writes_are_reassembled() {
    let (server, mut server_rx) = service_with_channel();
    let addr = server
        .start_server(0, vec![], prefs(&["2"]), "A")
        .await
        .unwrap();

    let mut peer = TestPeer::connect(addr.port()).await;
    peer.expect_handshake().await;

    let mut stream = SyncMessage::Username("B".into()).to_line();
    stream.extend(SyncMessage::LessonData(vec![Lesson::new("One", "2", "1")]).to_line());
    stream.extend(SyncMessage::LessonData(vec![Lesson::new("Two", "2", "2")]).to_line());
    for byte in stream {
        peer.send_raw(&[byte]).await;
        peer.write.flush().await.unwrap();
    }

    let first = timeout(WAIT, server_rx.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, server_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first[0].title, "One");
    assert_eq!(second[0].title, "Two");
    assert_eq!(first[0].source.as_deref(), Some("B"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_line_does_not_end_session() {
    let (server, mut server_rx) = service_with_channel();
    let addr = server
        .start_server(0, vec![Lesson::new("Intro", "2", "0")], prefs(&["2"]), "A")
        .await
        .unwrap();

    let mut peer = TestPeer::connect(addr.port()).await;
    peer.expect_handshake().await;

    let mut stream = SyncMessage::LessonData(vec![Lesson::new("Before", "2", "1")]).to_line();
    stream.extend_from_slice(b"{not json at all\n");
    stream.extend(br#"{"type":"FROM_THE_FUTURE","data":1}"#);
    stream.push(b'\n');
    stream.extend(SyncMessage::LessonData(vec![Lesson::new("After", "2", "2")]).to_line());
    peer.send_raw(&stream).await;

    let first = timeout(WAIT, server_rx.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, server_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first[0].title, "Before");
    assert_eq!(first[0].source.as_deref(), Some("Unknown"));
    assert_eq!(second[0].title, "After");

    // Still serving requests afterwards
    peer.send_raw(&SyncMessage::LessonRequest(LessonMetadata::new("2", "0")).to_line())
        .await;
    assert!(matches!(peer.recv().await, SyncMessage::LessonData(_)));

    server.shutdown().await;
}

#[tokio::test]
async fn test_repeated_metadata_requests_once() {
    let server = LessonSyncService::default();
    let addr = server
        .start_server(0, vec![], prefs(&["2"]), "A")
        .await
        .unwrap();

    let mut peer = TestPeer::connect(addr.port()).await;
    peer.expect_handshake().await;

    let metadata = SyncMessage::Metadata(vec![
        LessonMetadata::new("2", "0"),
        LessonMetadata::new("9", "0"),
    ]);
    peer.send_raw(&metadata.to_line()).await;
    peer.send_raw(&metadata.to_line()).await;

    assert_eq!(
        peer.recv().await,
        SyncMessage::LessonRequest(LessonMetadata::new("2", "0"))
    );
    // Nothing else follows
    let extra = timeout(SETTLE, peer.lines.next_line()).await;
    assert!(extra.is_err(), "unexpected extra message: {:?}", extra);

    server.shutdown().await;
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_stop_closes_sessions_and_listener() {
    let server = LessonSyncService::default();
    let addr = server
        .start_server(0, vec![], prefs(&[]), "A")
        .await
        .unwrap();

    let mut peer = TestPeer::connect(addr.port()).await;
    peer.expect_handshake().await;

    server.stop();
    server.stop();

    let end = timeout(WAIT, peer.lines.next_line()).await.unwrap();
    assert!(matches!(end, Ok(None) | Err(_)), "session should be closed");

    server.shutdown().await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_client_connect_failure_is_reported() {
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };

    let (client, mut rx) = service_with_channel();
    let result = client
        .connect_as_client("127.0.0.1", port, vec![], prefs(&["2"]), "B")
        .await;
    assert!(matches!(result, Err(SyncError::Connect { .. })));
    assert_eq!(client.session_count(), 0);

    client.stop();
    client.stop();
    assert!(rx.try_recv().is_err());
}

// ==================== Discovery and orchestration ====================

#[tokio::test]
async fn test_directory_sees_advertisement_come_and_go() {
    let network = InMemoryDiscovery::new("10.0.0.2");
    let host = SessionOrchestrator::new(
        SyncConfig {
            username: "Alice".into(),
            port: 8080,
            lessons: vec![],
            preferences: vec![],
        },
        network.clone(),
    );
    let watcher = SessionOrchestrator::new(SyncConfig::default(), network.join("10.0.0.3"));

    watcher.select_mode(Mode::Client).unwrap();
    host.select_mode(Mode::Server).unwrap();

    let servers = watcher.view().servers;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].name, "Alice");
    assert_eq!(servers[0].port, 8080);
    assert!(!servers[0].host.is_empty());

    host.directory().stop_advertising();
    assert!(watcher.view().servers.is_empty());
}

#[tokio::test]
async fn test_orchestrators_sync_over_loopback() {
    let network = InMemoryDiscovery::new("127.0.0.1");

    let alice = SessionOrchestrator::new(
        SyncConfig {
            username: "Alice".into(),
            port: 0,
            lessons: vec![Lesson::new("Intro", "2", "0"), Lesson::new("Optics", "9", "0")],
            preferences: prefs(&["2"]),
        },
        network.clone(),
    );
    let bob = SessionOrchestrator::new(
        SyncConfig {
            username: "Bob".into(),
            port: 0,
            lessons: vec![Lesson::new("Chemistry", "2", "7")],
            preferences: prefs(&["2"]),
        },
        network.join("127.0.0.1"),
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _sub = bob.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    alice.select_mode(Mode::Server).unwrap();
    alice.confirm_start().await.unwrap();

    bob.select_mode(Mode::Client).unwrap();
    assert!(matches!(
        bob.confirm_start().await,
        Err(OrchestratorError::NoServerSelected)
    ));

    // Advertisement was refreshed with the real port after binding
    let servers = bob.view().servers;
    assert_eq!(servers.len(), 1);
    assert_ne!(servers[0].port, 0);
    bob.choose_server(servers[0].clone()).unwrap();
    bob.confirm_start().await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while bob.view().new_lessons_count == 0 {
        assert!(tokio::time::Instant::now() < deadline, "Bob never got Alice's lesson");
        sleep(Duration::from_millis(20)).await;
    }

    let view = bob.view();
    assert_eq!(view.new_lessons_count, 1);
    assert_eq!(view.lessons.len(), 2);
    assert!(view.lessons.iter().any(|l| l.title == "Intro" && l.source.as_deref() == Some("Alice")));
    assert!(!view.lessons.iter().any(|l| l.topic_id == "9"));

    let updated: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, SyncEvent::LessonsUpdated { .. }))
        .cloned()
        .collect();
    assert_eq!(updated.len(), 1);

    // Alice also pulled Bob's lesson
    let deadline = tokio::time::Instant::now() + WAIT;
    while alice.view().new_lessons_count == 0 {
        assert!(tokio::time::Instant::now() < deadline, "Alice never got Bob's lesson");
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(alice.lessons().len(), 3);

    bob.stop();
    alice.stop();
    bob.stop();
}
