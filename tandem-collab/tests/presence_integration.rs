//! Sessions talking through a real relay: presence convergence, tab
//! switches, cursors and disconnect eviction.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use uuid::Uuid;

use tandem_collab::client::{RelayClient, RelayEvent};
use tandem_collab::presence::UserIdentity;
use tandem_collab::server::{RelayServer, ServerConfig};
use tandem_collab::session::{ClientSession, SessionConfig};
use tandem_collab::storage::MemoryStore;
use tandem_core::{Origin, Position};

type Session = ClientSession<RelayClient, MemoryStore>;

async fn start_test_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = RelayServer::new(ServerConfig::for_testing()).unwrap();
    tokio::spawn(async move {
        let _ = server.run_on(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

async fn session(
    url: &str,
    name: &str,
    project: Uuid,
    store: Arc<MemoryStore>,
) -> (Session, mpsc::Receiver<RelayEvent>) {
    let identity = UserIdentity::new(name);
    let mut client = RelayClient::new(identity.user_id, url);
    let rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let (session, _notices) =
        ClientSession::new(identity, project, client, store, SessionConfig::for_testing());
    (session, rx)
}

/// Feed relay frames into the session until `done` holds.
async fn pump_until(
    session: &mut Session,
    rx: &mut mpsc::Receiver<RelayEvent>,
    done: impl Fn(&Session) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !done(session) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, rx.recv()).await {
            Ok(Some(RelayEvent::Message(envelope))) => {
                session.handle_envelope(&envelope);
            }
            Ok(Some(_)) => {}
            Ok(None) => panic!("relay event channel closed"),
            Err(_) => panic!("condition not reached before deadline"),
        }
    }
}

/// Give the relay time to process frames already sent.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn roster_len(session: &Session, file: Uuid) -> usize {
    session.roster(file).map_or(0, |r| r.len())
}

#[tokio::test]
async fn test_rosters_converge_for_late_joiner() {
    let url = start_test_server().await;
    let project = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    let file = Uuid::new_v4();
    let (mut ann, mut ann_rx) = session(&url, "Ann", project, store.clone()).await;
    let (mut bob, mut bob_rx) = session(&url, "Bob", project, store).await;

    ann.open_file(file).await.unwrap();
    settle().await;
    bob.open_file(file).await.unwrap();

    // Ann learns of Bob from his join and answers his query on the way.
    pump_until(&mut ann, &mut ann_rx, |s| roster_len(s, file) == 2).await;
    // Bob learns of Ann only through her reply.
    pump_until(&mut bob, &mut bob_rx, |s| roster_len(s, file) == 2).await;

    let ann_id = ann.user_id();
    let seen_by_bob = bob.roster(file).unwrap().get(&ann_id).unwrap().clone();
    assert_eq!(seen_by_bob.display_name, "Ann");
    assert!(seen_by_bob.is_live);
    assert!(seen_by_bob.is_active_in_tab);
}

#[tokio::test]
async fn test_tab_switch_is_visible_to_peers() {
    let url = start_test_server().await;
    let project = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    let shared_file = Uuid::new_v4();
    let other_file = Uuid::new_v4();
    let (mut ann, mut ann_rx) = session(&url, "Ann", project, store.clone()).await;
    let (mut bob, mut bob_rx) = session(&url, "Bob", project, store).await;
    ann.open_file(shared_file).await.unwrap();
    settle().await;
    bob.open_file(shared_file).await.unwrap();
    pump_until(&mut ann, &mut ann_rx, |s| roster_len(s, shared_file) == 2).await;
    pump_until(&mut bob, &mut bob_rx, |s| roster_len(s, shared_file) == 2).await;

    let ann_id = ann.user_id();
    ann.open_file(other_file).await.unwrap();
    assert_eq!(ann.active_file(), Some(other_file));

    pump_until(&mut bob, &mut bob_rx, |s| {
        s.roster(shared_file)
            .and_then(|r| r.get(&ann_id))
            .is_some_and(|p| p.is_live && !p.is_active_in_tab)
    })
    .await;

    ann.switch_tab(shared_file).unwrap();
    pump_until(&mut bob, &mut bob_rx, |s| {
        s.roster(shared_file)
            .and_then(|r| r.get(&ann_id))
            .is_some_and(|p| p.is_active_in_tab)
    })
    .await;
}

#[tokio::test]
async fn test_edits_and_cursors_reach_peers() {
    let url = start_test_server().await;
    let project = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    let file = Uuid::new_v4();
    store.insert_file(project, file, "let x = 1;");
    let (mut ann, mut ann_rx) = session(&url, "Ann", project, store.clone()).await;
    let (mut bob, mut bob_rx) = session(&url, "Bob", project, store).await;
    ann.open_file(file).await.unwrap();
    settle().await;
    bob.open_file(file).await.unwrap();
    pump_until(&mut ann, &mut ann_rx, |s| roster_len(s, file) == 2).await;
    pump_until(&mut bob, &mut bob_rx, |s| roster_len(s, file) == 2).await;

    ann.local_edit(file, Position::new(0, 4), Position::new(0, 5), "y", Origin::Input)
        .unwrap();
    ann.move_cursor(file, Position::new(0, 5)).unwrap();

    pump_until(&mut bob, &mut bob_rx, |s| {
        s.text(file).as_deref() == Some("let y = 1;") && s.cursor_markers(file).len() == 1
    })
    .await;

    let marker = &bob.cursor_markers(file)[0];
    assert_eq!(marker.display_name, "Ann");
    assert_eq!((marker.line, marker.ch), (0, 5));
    assert!(bob.editor(file).unwrap().last_relay_seq().is_some());
    assert_eq!(bob.change_log().len(), 1);
}

#[tokio::test]
async fn test_dropped_connection_evicts_user() {
    let url = start_test_server().await;
    let project = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    let file = Uuid::new_v4();
    let (mut ann, mut ann_rx) = session(&url, "Ann", project, store.clone()).await;
    let (mut bob, mut bob_rx) = session(&url, "Bob", project, store).await;
    ann.open_file(file).await.unwrap();
    settle().await;
    bob.open_file(file).await.unwrap();
    pump_until(&mut ann, &mut ann_rx, |s| roster_len(s, file) == 2).await;
    ann.move_cursor(file, Position::ZERO).unwrap();
    pump_until(&mut bob, &mut bob_rx, |s| {
        roster_len(s, file) == 2 && s.cursor_markers(file).len() == 1
    })
    .await;

    // No goodbye: the socket just goes away.
    drop(ann);

    pump_until(&mut bob, &mut bob_rx, |s| {
        roster_len(s, file) == 1 && s.cursors().is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_graceful_close_removes_user() {
    let url = start_test_server().await;
    let project = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    let file = Uuid::new_v4();
    let (mut ann, mut ann_rx) = session(&url, "Ann", project, store.clone()).await;
    let (mut bob, mut bob_rx) = session(&url, "Bob", project, store).await;
    ann.open_file(file).await.unwrap();
    settle().await;
    bob.open_file(file).await.unwrap();
    pump_until(&mut ann, &mut ann_rx, |s| roster_len(s, file) == 2).await;
    pump_until(&mut bob, &mut bob_rx, |s| roster_len(s, file) == 2).await;

    ann.close().await;

    pump_until(&mut bob, &mut bob_rx, |s| roster_len(s, file) == 1).await;
    let only = bob.roster(file).unwrap().users()[0].user_id;
    assert_eq!(only, bob.user_id());
}
