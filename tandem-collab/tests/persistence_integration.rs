//! Persistence integration tests.
//!
//! Verifies:
//! - File contents round-trip through the RocksDB store
//! - A burst of edits produces one debounced save
//! - The relay appends relayed changes to the project log
//! - Saves reach an HTTP backend after the quiet window

use std::sync::Arc;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tandem_collab::client::{RelayClient, RelayEvent, RelaySink};
use tandem_collab::debounce::SaveNotice;
use tandem_collab::presence::UserIdentity;
use tandem_collab::protocol::{Envelope, Topic};
use tandem_collab::server::{RelayServer, ServerConfig};
use tandem_collab::session::{ClientSession, SessionConfig};
use tandem_collab::storage::{
    ContentStore, FileStore, HttpStore, HttpStoreConfig, StoreConfig, StoreError,
};
use tandem_core::{ChangeRecord, Origin, Position};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn change(file: Uuid, author: Uuid, text: &str, timestamp: u64) -> ChangeRecord {
    ChangeRecord {
        file_id: file,
        author_id: author,
        origin: Origin::Paste,
        from: Position::ZERO,
        to: Position::ZERO,
        removed_text: String::new(),
        inserted_text: text.into(),
        timestamp,
    }
}

async fn wait_for_pong(rx: &mut mpsc::Receiver<RelayEvent>) {
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for pong")
            .expect("event channel closed");
        if let RelayEvent::Message(env) = event {
            if env.topic == Topic::Pong {
                return;
            }
        }
    }
}

// ─── Content store ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_file_store_content_roundtrip() {
    let dir = tempdir().unwrap();
    let store = FileStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let project = Uuid::new_v4();
    let file = Uuid::new_v4();
    let text = "fn main() {\n    println!(\"héllo\");\n}\n".repeat(50);

    store.save_content(project, file, text.clone()).await.unwrap();
    assert_eq!(store.fetch_content(project, file).await.unwrap(), text);

    let meta = store.load_metadata(file).unwrap();
    assert_eq!(meta.project_id, project);
    assert_eq!(meta.size, text.len() as u64);
    assert!(meta.compressed_size < meta.size);

    let missing = Uuid::new_v4();
    assert_eq!(
        store.fetch_content(project, missing).await.unwrap_err(),
        StoreError::NotFound(missing)
    );
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_edits_is_saved_once() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FileStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let project = Uuid::new_v4();
    let file = Uuid::new_v4();
    let (relay, _sent) = mpsc::unbounded_channel::<Envelope>();
    let (mut session, mut notices) = ClientSession::new(
        UserIdentity::new("Ann"),
        project,
        relay,
        store.clone(),
        SessionConfig::default(),
    );
    session.open_file(file).await.unwrap();

    for (i, ch) in "draft".chars().enumerate() {
        let at = Position::new(0, i as u32);
        session
            .local_edit(file, at, at, &ch.to_string(), Origin::Input)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    assert!(!store.file_exists(file).unwrap());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(
        notices.recv().await,
        Some(SaveNotice::Saved { file_id: file, bytes: 5 })
    );
    assert_eq!(store.load_file(file).unwrap(), "draft");
    assert_eq!(store.load_metadata(file).unwrap().revision, 1);
}

#[tokio::test]
async fn test_close_saves_pending_edits_immediately() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FileStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let file = Uuid::new_v4();
    let (relay, _sent) = mpsc::unbounded_channel::<Envelope>();
    let (mut session, _notices) = ClientSession::new(
        UserIdentity::new("Ann"),
        Uuid::new_v4(),
        relay,
        store.clone(),
        SessionConfig::default(),
    );
    session.open_file(file).await.unwrap();
    session
        .local_edit(file, Position::ZERO, Position::ZERO, "unsaved", Origin::Paste)
        .unwrap();

    session.close().await;
    assert_eq!(store.load_file(file).unwrap(), "unsaved");
}

// ─── Relay change log ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_relay_persists_changes_in_order() {
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        storage_path: Some(dir.path().to_path_buf()),
        ..ServerConfig::for_testing()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
    let server = Arc::new(RelayServer::new(config).unwrap());
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = running.run_on(listener).await;
    });

    let project = Uuid::new_v4();
    let file = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let mut client = RelayClient::new(alice, &url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    client
        .emit(Envelope::join_file(alice, file, project).unwrap())
        .unwrap();
    let records = [
        change(file, alice, "a", 1),
        change(file, alice, "b", 2),
        change(file, alice, "c", 3),
    ];
    for record in &records {
        client.emit(Envelope::send_change(record).unwrap()).unwrap();
    }
    client.emit(Envelope::ping(alice)).unwrap();
    wait_for_pong(&mut rx).await;

    let store = server.store().unwrap();
    let log = store.load_changes(project).unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(
        log.iter().map(|e| e.relay_seq).collect::<Vec<_>>(),
        vec![Some(1), Some(2), Some(3)]
    );
    assert_eq!(
        log.iter().map(|e| e.change.clone()).collect::<Vec<_>>(),
        records.to_vec()
    );
    assert_eq!(server.stats().await.persisted_changes, 3);

    // The same log serves history loads through the store trait.
    let fetched = store.fetch_change_log(project).await.unwrap();
    assert_eq!(fetched, log);
    assert!(store.load_changes(Uuid::new_v4()).unwrap().is_empty());
}

// ─── HTTP backend ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_over_http_backend() {
    let backend = MockServer::start().await;
    let project = Uuid::new_v4();
    let file = Uuid::new_v4();
    let content_path = format!("/projects/{project}/files/{file}/content");
    Mock::given(method("GET"))
        .and(path(content_path.clone()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "content": "x = 1\n" })),
        )
        .mount(&backend)
        .await;
    Mock::given(method("PUT"))
        .and(path(content_path))
        .and(body_json(serde_json::json!({ "content": "x = 42\n" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&backend)
        .await;

    let store = Arc::new(HttpStore::new(HttpStoreConfig::for_testing(backend.uri())).unwrap());
    let (relay, _sent) = mpsc::unbounded_channel::<Envelope>();
    let (mut session, mut notices) = ClientSession::new(
        UserIdentity::new("Ann"),
        project,
        relay,
        store,
        SessionConfig::for_testing(),
    );
    session.open_file(file).await.unwrap();
    assert_eq!(session.text(file).as_deref(), Some("x = 1\n"));

    session
        .local_edit(file, Position::new(0, 4), Position::new(0, 5), "4", Origin::Input)
        .unwrap();
    session
        .local_edit(file, Position::new(0, 5), Position::new(0, 5), "2", Origin::Input)
        .unwrap();

    let notice = timeout(Duration::from_secs(2), notices.recv()).await.unwrap();
    assert_eq!(notice, Some(SaveNotice::Saved { file_id: file, bytes: 7 }));
}

#[tokio::test]
async fn test_failed_http_save_is_reported() {
    let backend = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&backend)
        .await;

    let store = Arc::new(HttpStore::new(HttpStoreConfig::for_testing(backend.uri())).unwrap());
    let file = Uuid::new_v4();
    let (relay, _sent) = mpsc::unbounded_channel::<Envelope>();
    let (mut session, mut notices) = ClientSession::new(
        UserIdentity::new("Ann"),
        Uuid::new_v4(),
        relay,
        store,
        SessionConfig::for_testing(),
    );
    session.open_file(file).await.unwrap();
    assert_eq!(session.text(file).as_deref(), Some(""));
    session
        .local_edit(file, Position::ZERO, Position::ZERO, "lost", Origin::Input)
        .unwrap();

    let notice = timeout(Duration::from_secs(2), notices.recv()).await.unwrap();
    assert_eq!(
        notice,
        Some(SaveNotice::Failed {
            file_id: file,
            error: StoreError::Http { status: 500 },
        })
    );
    // The edit stays in the buffer.
    assert_eq!(session.text(file).as_deref(), Some("lost"));
}
