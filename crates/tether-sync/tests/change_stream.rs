use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tether_store::{
    DocumentPath, DocumentSnapshot, Filter, Listener, MemoryStore, Query, RemoteStore, StoreError,
    WriteBatch,
};
use tether_sync::{RoomChangeStream, SyncError, paths};
use tether_types::RoomId;

fn room_ids(n: usize) -> Vec<RoomId> {
    (0..n).map(|i| RoomId::from(format!("room-{:02}", i))).collect()
}

async fn store_with_rooms(ids: &[RoomId]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let mut batch = WriteBatch::new();
    for id in ids {
        batch = batch.set(
            paths::room(id),
            json!({ "name": id, "creatorId": "u1", "createdAt": 1, "participants": ["u1"] }),
        );
    }
    store.commit(batch).await.unwrap();
    store
}

/// Every listener takes 100ms to come up.
struct SlowListens(MemoryStore);

#[async_trait]
impl RemoteStore for SlowListens {
    async fn get(&self, path: &DocumentPath) -> Result<Option<DocumentSnapshot>, StoreError> {
        self.0.get(path).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>, StoreError> {
        self.0.query(query).await
    }

    fn new_document_path(&self, collection: &str) -> DocumentPath {
        self.0.new_document_path(collection)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.0.commit(batch).await
    }

    async fn listen(&self, query: &Query) -> Result<Listener, StoreError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.0.listen(query).await
    }
}

fn occurrences(coverage: &[Vec<RoomId>], room: &RoomId) -> usize {
    coverage.iter().flatten().filter(|id| *id == room).count()
}

#[tokio::test]
async fn rooms_are_covered_exactly_once_in_chunks_of_ten() {
    let ids = room_ids(25);
    let store = store_with_rooms(&ids).await;
    let stream = RoomChangeStream::new(store.clone());

    stream.watch(ids.clone()).await.unwrap();

    assert_eq!(stream.listeners().await.len(), 3);
    assert_eq!(store.active_listeners(), 3);

    let coverage = stream.coverage().await;
    assert!(coverage.iter().all(|chunk| chunk.len() <= 10));
    let covered: Vec<RoomId> = coverage.into_iter().flatten().collect();
    assert_eq!(covered.len(), ids.len());
    assert_eq!(covered.into_iter().collect::<BTreeSet<_>>(), ids.iter().cloned().collect());

    for query in store.listener_queries() {
        assert_eq!(query.collection, paths::ROOMS);
        match &query.filters[..] {
            [Filter::In(field, values)] => {
                assert_eq!(field, tether_store::DOCUMENT_ID);
                assert!(values.len() <= 10);
            }
            other => panic!("unexpected filters {:?}", other),
        }
    }
}

#[tokio::test]
async fn unchanged_set_keeps_listeners() {
    let ids = room_ids(12);
    let store = store_with_rooms(&ids).await;
    let stream = RoomChangeStream::new(store.clone());

    stream.watch(ids.clone()).await.unwrap();
    let before = stream.listeners().await;

    let mut reordered = ids.clone();
    reordered.reverse();
    stream.watch(reordered).await.unwrap();
    assert_eq!(stream.listeners().await, before);

    stream.watch(ids[..5].to_vec()).await.unwrap();
    let after = stream.listeners().await;
    assert_eq!(after.len(), 1);
    assert!(after.iter().all(|(_, id)| before.iter().all(|(_, old)| old != id)));
    assert_eq!(store.active_listeners(), 1);
}

#[tokio::test]
async fn empty_set_stops_everything() {
    let ids = room_ids(3);
    let store = store_with_rooms(&ids).await;
    let stream = RoomChangeStream::new(store.clone());

    stream.watch(ids).await.unwrap();
    stream.watch(Vec::new()).await.unwrap();
    assert!(stream.watched().await.is_empty());
    assert_eq!(store.active_listeners(), 0);
}

#[tokio::test]
async fn single_watch_is_skipped_for_covered_rooms() {
    let ids = room_ids(3);
    let store = store_with_rooms(&ids).await;
    let stream = RoomChangeStream::new(store.clone());

    stream.watch(ids[..2].to_vec()).await.unwrap();
    assert!(!stream.watch_single(&ids[0]).await.unwrap());
    assert!(stream.watch_single(&ids[2]).await.unwrap());
    assert_eq!(stream.listeners().await.len(), 2);
    assert_eq!(stream.watched().await.len(), 3);

    stream.stop_all().await;
    assert_eq!(store.active_listeners(), 0);
}

#[tokio::test]
async fn failed_setup_is_typed_and_retryable() {
    let ids = room_ids(4);
    let store = store_with_rooms(&ids).await;
    let stream = RoomChangeStream::new(store.clone());

    store.fail_next_listens(1);
    let err = stream.watch(ids.clone()).await.unwrap_err();
    assert!(matches!(err, SyncError::ListenerSetup { .. }));
    assert!(stream.watched().await.is_empty());

    stream.watch(ids.clone()).await.unwrap();
    assert_eq!(stream.watched().await.len(), 4);
}

#[tokio::test]
async fn room_updates_reach_the_feed() {
    let ids = room_ids(2);
    let store = store_with_rooms(&ids).await;
    let stream = RoomChangeStream::new(store.clone());
    let mut changes = stream.changes();

    stream.watch(ids.clone()).await.unwrap();
    // initial snapshot
    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
    }

    store
        .update(
            &paths::room(&ids[1]),
            vec![(paths::NAME.into(), tether_store::FieldValue::Set(json!("renamed")))],
        )
        .await
        .unwrap();
    let room = tokio::time::timeout(Duration::from_secs(1), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(room.id, ids[1]);
    assert_eq!(room.name, "renamed");
}

#[tokio::test(start_paused = true)]
async fn newer_watch_supersedes_setup_in_flight() {
    let ids = room_ids(20);
    let store = store_with_rooms(&ids).await;
    let stream = RoomChangeStream::new(Arc::new(SlowListens((*store).clone())));
    let first_set = ids[..15].to_vec();
    let second_set = ids[10..].to_vec();

    // The first watch has one chunk up and the second one in flight.
    let (first, second) = tokio::join!(stream.watch(first_set), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        stream.watch(second_set.clone()).await
    });

    assert!(matches!(first, Err(SyncError::Superseded)));
    second.unwrap();

    let listeners = stream.listeners().await;
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].0, tether_sync::chunk_signature(&second_set));
    assert_eq!(store.active_listeners(), 1);
    assert_eq!(
        stream.watched().await,
        second_set.iter().cloned().collect::<BTreeSet<_>>()
    );
}

#[tokio::test(start_paused = true)]
async fn single_watch_defers_to_watch_in_flight() {
    let ids = room_ids(20);
    let store = store_with_rooms(&ids).await;
    let stream = RoomChangeStream::new(Arc::new(SlowListens((*store).clone())));

    let (all, single) = tokio::join!(stream.watch(ids.clone()), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.watch_single(&ids[15]).await
    });

    all.unwrap();
    assert!(!single.unwrap());
    assert_eq!(stream.listeners().await.len(), 2);
    assert_eq!(store.active_listeners(), 2);

    let coverage = stream.coverage().await;
    assert!(ids.iter().all(|id| occurrences(&coverage, id) == 1));
}
