use serde_json::json;
use tether_store::{
    Direction, DocumentPath, FieldValue, MemoryStore, Precondition, Query, RemoteStore, WriteBatch,
};

async fn bump_with_retry(store: MemoryStore, room: DocumentPath) -> i64 {
    loop {
        let current = store
            .get_fresh(&room)
            .await
            .unwrap()
            .and_then(|d| d.field("lastMessageSeq").and_then(|v| v.as_i64()))
            .unwrap_or(0);
        let next = current + 1;
        let batch = WriteBatch::new()
            .require(Precondition::FieldEquals {
                path: room.clone(),
                field: "lastMessageSeq".into(),
                value: json!(current),
            })
            .update(room.clone(), vec![("lastMessageSeq".into(), FieldValue::Set(json!(next)))])
            .set(
                DocumentPath::new("rooms/r1/messages", format!("m{}", next)),
                json!({ "seq": next }),
            );
        match store.commit(batch).await {
            Ok(()) => return next,
            Err(e) if e.is_conflict() => {
                tokio::task::yield_now().await;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_get_distinct_sequence_numbers() {
    let store = MemoryStore::new();
    let room = DocumentPath::new("rooms", "r1");
    store.set(&room, json!({ "name": "general", "lastMessageSeq": 0 })).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| tokio::spawn(bump_with_retry(store.clone(), room.clone())))
        .collect();
    let mut seqs = Vec::new();
    for task in tasks {
        seqs.push(task.await.unwrap());
    }
    seqs.sort();
    assert_eq!(seqs, (1..=8).collect::<Vec<_>>());

    let stored = store
        .query(&Query::collection("rooms/r1/messages").order_by("seq", Direction::Ascending))
        .await
        .unwrap();
    assert_eq!(stored.len(), 8);
    assert_eq!(store.document(&room).unwrap()["lastMessageSeq"], json!(8));
}

#[tokio::test]
async fn listener_is_released_when_handle_dropped() {
    let store = MemoryStore::new();
    let listener = store.listen(&Query::collection("rooms")).await.unwrap();
    assert_eq!(store.active_listeners(), 1);
    drop(listener);
    assert_eq!(store.active_listeners(), 0);
}

#[tokio::test]
async fn injected_listen_failures_are_consumed() {
    let store = MemoryStore::new();
    store.fail_next_listens(2);
    assert!(store.listen(&Query::collection("rooms")).await.is_err());
    assert!(store.listen(&Query::collection("rooms")).await.is_err());
    assert!(store.listen(&Query::collection("rooms")).await.is_ok());
}

#[tokio::test]
async fn generated_paths_are_unique() {
    let store = MemoryStore::new();
    let a = store.new_document_path("rooms");
    let b = store.new_document_path("rooms");
    assert_ne!(a, b);
    assert_eq!(a.collection(), "rooms");
    assert_eq!(a.id().len(), 20);
}
