use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tether_db::{Database, LocalCache, SqliteCache};
use tether_types::{Attachment, AttachmentKind, Author, Message, Room, RoomId};

fn cache() -> SqliteCache {
    SqliteCache::new(Arc::new(Database::open_in_memory().unwrap()))
}

fn author() -> Author {
    Author {
        id: "u1".into(),
        display_name: "Ada".into(),
    }
}

fn sequenced(room: &RoomId, seq: i64) -> Message {
    let mut m = Message::text(room.clone(), &author(), format!("#{}", seq));
    m.seq = Some(seq);
    m
}

#[tokio::test]
async fn cached_messages_are_oldest_first() {
    let cache = cache();
    let room = RoomId::from("r1");
    let messages: Vec<_> = (1..=5).map(|s| sequenced(&room, s)).collect();
    cache.store_messages(&room, &messages).await.unwrap();

    let cached = cache.cached_messages(&room, 3).await.unwrap();
    let seqs: Vec<_> = cached.iter().map(|m| m.seq.unwrap()).collect();
    assert_eq!(seqs, [3, 4, 5]);
    assert_eq!(cached[0].text.as_deref(), Some("#3"));
}

#[tokio::test]
async fn messages_for_other_rooms_are_not_cached() {
    let cache = cache();
    let room = RoomId::from("r1");
    let stray = sequenced(&RoomId::from("r2"), 1);
    cache.store_messages(&room, &[stray]).await.unwrap();
    assert!(cache.cached_messages(&room, 10).await.unwrap().is_empty());
    assert!(cache.cached_messages(&RoomId::from("r2"), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn forget_room_removes_messages_media_and_room() {
    let cache = cache();
    let room = RoomId::from("r1");

    let mut with_media = sequenced(&room, 1);
    with_media.attachments.push(Attachment {
        kind: AttachmentKind::Image,
        index: 0,
        thumbnail: "file:///tmp/thumb.jpg".into(),
        original: "file:///tmp/photo.jpg".into(),
        width: 10,
        height: 10,
        byte_size: 3,
        content_hash: String::new(),
        perceptual_hash: None,
        duration_ms: None,
    });
    cache.store_messages(&room, &[with_media]).await.unwrap();

    let stored = Room {
        id: room.clone(),
        name: "general".into(),
        description: String::new(),
        participants: [author().id].into_iter().collect(),
        creator_id: author().id,
        created_at: Utc.timestamp_millis_opt(1_000).unwrap(),
        last_message: None,
        last_message_at: None,
        last_message_seq: None,
        image_url: None,
        thumbnail_url: None,
        announcement: None,
    };
    cache.store_rooms(&[stored]).await.unwrap();

    let paths = cache.database().media_paths("r1").unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].local_path, "/tmp/photo.jpg");
    assert!(cache.database().get_room("r1").unwrap().is_some());

    cache.forget_room(&room).await.unwrap();
    assert!(cache.cached_messages(&room, 10).await.unwrap().is_empty());
    assert!(cache.database().media_paths("r1").unwrap().is_empty());
    assert!(cache.database().get_room("r1").unwrap().is_none());
}
