use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_db::{Database, LocalCache, SqliteCache};
use tether_gateway::{ConnectionState, LoopbackConnection, SendOutcome};
use tether_store::{MemoryStore, RemoteStore};
use tether_sync::{ChatSession, NewRoom, SessionConfig, SyncError, paths};
use tether_types::{Author, RoomId};

struct Harness {
    store: Arc<MemoryStore>,
    conn: LoopbackConnection,
    cache: Arc<SqliteCache>,
    session: ChatSession,
}

fn author(id: &str) -> Author {
    Author {
        id: id.into(),
        display_name: id.to_uppercase(),
    }
}

fn harness(store: Arc<MemoryStore>, user: &str) -> Harness {
    let conn = LoopbackConnection::with_echo();
    let cache = Arc::new(SqliteCache::new(Arc::new(Database::open_in_memory().unwrap())));
    let session = ChatSession::new(
        author(user),
        store.clone(),
        Arc::new(conn.clone()),
        Some(cache.clone()),
        SessionConfig::default(),
    );
    Harness {
        store,
        conn,
        cache,
        session,
    }
}

fn general() -> NewRoom {
    NewRoom {
        name: "general".into(),
        ..NewRoom::default()
    }
}

#[tokio::test]
async fn sent_messages_are_sequenced_persisted_and_cached() {
    let h = harness(Arc::new(MemoryStore::new()), "u1");
    let room = h.session.create_room(general()).await.unwrap();
    h.session.join_and_connect(&room.id).await.unwrap();
    assert_eq!(h.session.transport().state().await, ConnectionState::Connected);

    let mut view = h.session.enter_room(&room.id).await.unwrap();
    assert!(view.history.is_empty());

    let outcome = h.session.send_text(&room.id, "hello").await;
    let SendOutcome::Delivered { message, .. } = outcome else {
        panic!("send failed");
    };
    assert_eq!(message.seq, Some(1));

    let live = tokio::time::timeout(Duration::from_secs(1), view.live.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.id, message.id);

    assert_eq!(h.store.document_count(&paths::messages(&room.id)), 1);
    let room_doc = h.store.document(&paths::room(&room.id)).unwrap();
    assert_eq!(room_doc[paths::LAST_MESSAGE], "hello");
    assert_eq!(room_doc[paths::LAST_MESSAGE_SEQ], 1);

    let cached = h.cache.cached_messages(&room.id, 10).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, message.id);

    let reopened = h.session.messages().fetch_page(&room.id, 10, true).await.unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened[0].seq, Some(1));
}

#[tokio::test]
async fn second_user_joins_and_leaves() {
    let store = Arc::new(MemoryStore::new());
    let owner = harness(store.clone(), "u1");
    let room = owner.session.create_room(general()).await.unwrap();

    let guest = harness(store.clone(), "u2");
    let joined = guest.session.join_and_connect(&room.id).await.unwrap();
    assert!(joined.has_participant(&"u2".into()));
    assert_eq!(guest.conn.emitted_payloads("join_room").len(), 1);

    guest.session.enter_room(&room.id).await.unwrap();
    guest.session.leave(&room.id).await.unwrap();
    assert_eq!(guest.conn.emitted_payloads("leave_room").len(), 1);
    assert_eq!(guest.session.transport().subscriber_count(&room.id).await, 0);

    let room_doc = store.document(&paths::room(&room.id)).unwrap();
    assert_eq!(room_doc[paths::PARTICIPANTS], json!(["u1"]));

    assert!(matches!(
        owner.session.leave(&room.id).await,
        Err(SyncError::LastParticipant { .. })
    ));
}

#[tokio::test]
async fn room_list_is_ranked_and_cached() {
    let store = Arc::new(MemoryStore::new());
    let h = harness(store, "u1");
    let quiet = h.session.create_room(general()).await.unwrap();
    let busy = h
        .session
        .create_room(NewRoom {
            name: "busy".into(),
            ..NewRoom::default()
        })
        .await
        .unwrap();
    h.session.join_and_connect(&busy.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(h.session.send_text(&busy.id, "ping").await.is_delivered());

    let page = h.session.refresh_room_list().await.unwrap();
    let ids: Vec<_> = page.entries.iter().map(|e| e.room.id.clone()).collect();
    assert_eq!(ids, [busy.id.clone(), quiet.id.clone()]);
    assert_eq!(page.entries[0].previews.len(), 1);
    assert!(page.next_cursor.is_none());

    let rows = h.cache.database().get_rooms(10).unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn room_watch_retries_failed_listener_setup() {
    let store = Arc::new(MemoryStore::new());
    let h = harness(store.clone(), "u1");
    let lobby = RoomId::from("lobby");
    store
        .set(
            &paths::room(&lobby),
            json!({ "name": "lobby", "creatorId": "u1", "createdAt": 1, "participants": ["u1"] }),
        )
        .await
        .unwrap();

    store.fail_next_listens(2);
    h.session.watch_rooms([lobby]).await.unwrap();
    assert_eq!(h.session.room_changes().watched().await.len(), 1);
    assert_eq!(store.active_listeners(), 1);
}

#[tokio::test]
async fn send_while_disconnected_fails_locally() {
    let h = harness(Arc::new(MemoryStore::new()), "u1");
    let room = h.session.create_room(general()).await.unwrap();

    let outcome = h.session.send_text(&room.id, "offline").await;
    assert!(!outcome.is_delivered());
    assert!(outcome.message().failed);
    assert_eq!(h.store.document_count(&paths::messages(&room.id)), 0);
    assert!(h.conn.emitted().is_empty());
}
