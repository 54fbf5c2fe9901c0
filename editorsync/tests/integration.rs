//! End-to-end tests over real WebSockets.
//!
//! These tests start the relay on a free port and connect real sessions,
//! verifying the full sync pipeline.

use std::sync::Arc;

use editorsync::events::{EventKind, SessionEvent};
use editorsync::participants::{Directory, UserProfile};
use editorsync::server::{ServerConfig, SyncServer};
use editorsync::session::{FileModel, LocalIdentity, SessionConfig, StartOptions, SyncSession, SyncState};
use editorsync::transport::WebSocketConnector;
use editorsync::{Position, SessionError};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

struct Doc(&'static str);

impl FileModel for Doc {
    fn path(&self) -> String {
        self.0.to_string()
    }
}

/// Start a relay on a free port, return it with its URL.
async fn start_test_server() -> (SyncServer, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
    };
    let server = SyncServer::new(config);
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn directory() -> Arc<Directory> {
    Arc::new(
        Directory::new()
            .with(UserProfile::new("alice", "Alice"))
            .with(UserProfile::new("bob", "Bob")),
    )
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_content(expected: &'static str) -> impl Fn(&SessionEvent) -> bool {
    move |e| matches!(e, SessionEvent::ContentChanged { content, .. } if content == expected)
}

/// Connect a session for `user` to `path` and wait until it is stable.
async fn join(
    url: &str,
    user: &str,
    path: &'static str,
    config: SessionConfig,
) -> (SyncSession<WebSocketConnector>, broadcast::Receiver<SessionEvent>) {
    let mut session = SyncSession::new(
        config,
        LocalIdentity::new(user, ""),
        WebSocketConnector::new(url),
        directory(),
    );
    let mut events = session.events().subscribe();
    session.start(Arc::new(Doc(path)), StartOptions::default()).await.unwrap();
    wait_for(&mut events, |e| *e == SessionEvent::SyncStateChanged(SyncState::Stable)).await;
    (session, events)
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_two_sessions_converge() {
    let (server, url) = start_test_server().await;
    let (alice, mut alice_events) = join(&url, "alice", "/notes.txt", SessionConfig::default()).await;
    let (bob, mut bob_events) = join(&url, "bob", "/notes.txt", SessionConfig::default()).await;

    alice.update_content("hello").await.unwrap();
    wait_for(&mut bob_events, is_content("hello")).await;

    bob.update_content("hello world").await.unwrap();
    wait_for(&mut alice_events, is_content("hello world")).await;

    assert_eq!(alice.content().await, "hello world");
    assert_eq!(bob.content().await, "hello world");
    assert_eq!(server.room_content("/notes.txt").await.as_deref(), Some("hello world"));
    assert_eq!(server.stats().await.patches_applied, 2);
}

#[tokio::test]
async fn test_late_joiner_gets_full_content() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = join(&url, "alice", "/late.txt", SessionConfig::default()).await;
    alice.update_content("first draft").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (bob, _bob_events) = join(&url, "bob", "/late.txt", SessionConfig::default()).await;
    assert_eq!(bob.content().await, "first draft");
    assert!(bob.is_modified().await);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = join(&url, "alice", "/one.txt", SessionConfig::default()).await;
    let (bob, mut bob_events) = join(&url, "bob", "/two.txt", SessionConfig::default()).await;

    alice.update_content("only in one").await.unwrap();
    let leaked = timeout(Duration::from_millis(200), async {
        loop {
            if let Ok(event) = bob_events.recv().await {
                if event.kind() == EventKind::Content {
                    return event;
                }
            }
        }
    })
    .await;
    assert!(leaked.is_err(), "Room two should not receive room one content");
    assert_eq!(bob.content().await, "");
}

#[tokio::test]
async fn test_cursor_presence_between_sessions() {
    let (_server, url) = start_test_server().await;
    let (alice, mut alice_events) = join(&url, "alice", "/cursor.txt", SessionConfig::default()).await;
    let (_bob, mut bob_events) = join(&url, "bob", "/cursor.txt", SessionConfig::default()).await;

    // Alice learns about bob through the roster push.
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::ParticipantsChanged(delta) if delta.added.contains(&"bob".to_string()))
    })
    .await;
    // Bob already has alice in the sync roster.
    assert!(alice.update_cursor(Position::new(2, 0)).await);

    let moved = wait_for(&mut bob_events, |e| e.kind() == EventKind::CursorMove).await;
    match moved {
        SessionEvent::CursorMoved { user_id, cursor } => {
            assert_eq!(user_id, "alice");
            assert_eq!(cursor.position, Position::new(2, 0));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_save_clears_modified_everywhere() {
    let (server, url) = start_test_server().await;
    let (alice, _alice_events) = join(&url, "alice", "/save.txt", SessionConfig::default()).await;
    let (_bob, mut bob_events) = join(&url, "bob", "/save.txt", SessionConfig::default()).await;

    alice.update_content("dirty").await.unwrap();
    wait_for(&mut bob_events, is_content("dirty")).await;

    assert!(alice.save(serde_json::json!({})).await);
    wait_for(&mut bob_events, |e| *e == SessionEvent::Modified(false)).await;
    assert_eq!(server.room_modified("/save.txt").await, Some(false));
}

#[tokio::test]
async fn test_heartbeat_keeps_session_stable() {
    let (_server, url) = start_test_server().await;
    let config = SessionConfig::default().with_heartbeat_interval(Duration::from_millis(50));
    let (alice, mut events) = join(&url, "alice", "/beat.txt", config).await;

    let degraded = timeout(Duration::from_millis(400), async {
        loop {
            if let Ok(SessionEvent::SyncStateChanged(SyncState::Syncing)) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(degraded.is_err(), "Relay answers pings, session should stay stable");
    assert_eq!(alice.state().await, SyncState::Stable);
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut session = SyncSession::new(
        SessionConfig::default(),
        LocalIdentity::anonymous(),
        WebSocketConnector::new(format!("ws://127.0.0.1:{port}")),
        directory(),
    );
    let err = session.start(Arc::new(Doc("/nowhere.txt")), StartOptions::default()).await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(_)), "got {err:?}");
    assert_eq!(session.state().await, SyncState::Disconnected);
}

#[tokio::test]
async fn test_close_leaves_room() {
    let (_server, url) = start_test_server().await;
    let (mut alice, _alice_events) = join(&url, "alice", "/bye.txt", SessionConfig::default()).await;
    let (bob, mut bob_events) = join(&url, "bob", "/bye.txt", SessionConfig::default()).await;
    // The sync that made bob stable carried both of them.
    assert_eq!(bob.participants().await.len(), 2);

    alice.close().await;
    wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::ParticipantsChanged(delta) if delta.removed.contains(&"alice".to_string()))
    })
    .await;
    assert_eq!(bob.participants().await.len(), 1);
}
