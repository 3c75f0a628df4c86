use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tether_gateway::ActivityRecorder;
use tether_store::{Cursor, Direction, FieldValue, Query, RemoteStore, StoreError};
use tether_types::{Announcement, Message, Room, RoomId};

use crate::decode::decode_all;
use crate::error::SyncError;
use crate::paths;

pub const DEFAULT_PAGE_SIZE: usize = 30;
pub const DEFAULT_PREVIEW_COUNT: usize = 3;

/// A room with its newest messages, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEntry {
    pub room: Room,
    pub previews: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct RoomPage {
    pub entries: Vec<RoomEntry>,
    /// `None` once the list is exhausted.
    pub next_cursor: Option<Cursor>,
}

/// Fields to change on a room. `None` leaves a field untouched;
/// `announcement: Some(None)` clears the announcement.
#[derive(Debug, Clone, Default)]
pub struct RoomEdit {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub announcement: Option<Option<Announcement>>,
}

impl RoomEdit {
    fn fields(&self) -> Result<Vec<(String, FieldValue)>, SyncError> {
        fn set(name: &str, value: Value) -> (String, FieldValue) {
            (name.to_string(), FieldValue::Set(value))
        }

        let mut fields = Vec::new();
        if let Some(name) = &self.name {
            fields.push(set(paths::NAME, json!(name)));
        }
        if let Some(description) = &self.description {
            fields.push(set(paths::DESCRIPTION, json!(description)));
        }
        if let Some(url) = &self.image_url {
            fields.push(set(paths::IMAGE_URL, json!(url)));
        }
        if let Some(url) = &self.thumbnail_url {
            fields.push(set(paths::THUMBNAIL_URL, json!(url)));
        }
        match &self.announcement {
            Some(Some(announcement)) => {
                let value = serde_json::to_value(announcement).map_err(StoreError::from)?;
                fields.push(set(paths::ANNOUNCEMENT, value));
            }
            Some(None) => fields.push((paths::ANNOUNCEMENT.to_string(), FieldValue::Delete)),
            None => {}
        }
        Ok(fields)
    }

    fn apply(&self, room: &mut Room) {
        if let Some(name) = &self.name {
            room.name = name.clone();
        }
        if let Some(description) = &self.description {
            room.description = description.clone();
        }
        if let Some(url) = &self.image_url {
            room.image_url = Some(url.clone());
        }
        if let Some(url) = &self.thumbnail_url {
            room.thumbnail_url = Some(url.clone());
        }
        if let Some(announcement) = &self.announcement {
            room.announcement = announcement.clone();
        }
    }
}

/// The ranked room list: most recently active first, each room with a
/// few preview messages.
pub struct RoomDirectory {
    store: Arc<dyn RemoteStore>,
    preview_count: usize,
    cache: Mutex<Vec<RoomEntry>>,
}

impl RoomDirectory {
    pub fn new(store: Arc<dyn RemoteStore>, preview_count: usize) -> Self {
        Self {
            store,
            preview_count,
            cache: Mutex::new(Vec::new()),
        }
    }

    /// Fetch one page of rooms by last activity, descending, with previews.
    /// The page replaces the cached entries; callers concatenate pages.
    pub async fn fetch_top_rooms_page(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<RoomPage, SyncError> {
        if limit == 0 {
            return Err(SyncError::InvalidArgument("page size must be positive".into()));
        }

        let query = Query::collection(paths::ROOMS)
            .order_by(paths::LAST_MESSAGE_AT, Direction::Descending)
            .start_after(cursor)
            .limit(limit);
        let docs = self.store.query(&query).await?;
        let rooms: Vec<Room> = decode_all(&docs, "room");

        let previews: Vec<Vec<Message>> = stream::iter(
            rooms
                .iter()
                .map(|room| self.fetch_preview_messages(&room.id, self.preview_count)),
        )
        .buffered(limit)
        .collect()
        .await;

        let entries: Vec<RoomEntry> = rooms
            .into_iter()
            .zip(previews)
            .map(|(room, previews)| RoomEntry { room, previews })
            .collect();

        let next_cursor = if docs.len() == limit {
            docs.last().map(Cursor::after)
        } else {
            None
        };

        debug!(
            "Fetched room page: {} rooms ({} documents), more={}",
            entries.len(),
            docs.len(),
            next_cursor.is_some()
        );
        *self.cache.lock().await = entries.clone();

        Ok(RoomPage {
            entries,
            next_cursor,
        })
    }

    /// Up to `n` newest messages of a room, oldest first. Sequence order is
    /// tried first; rooms without sequenced messages fall back to sent time.
    /// Never fails: errors yield an empty list.
    pub async fn fetch_preview_messages(&self, room_id: &RoomId, n: usize) -> Vec<Message> {
        if n == 0 {
            return Vec::new();
        }
        let collection = paths::messages(room_id);

        let by_seq = Query::collection(collection.as_str())
            .order_by(paths::SEQ, Direction::Descending)
            .limit(n);
        match self.store.query(&by_seq).await {
            Ok(docs) if !docs.is_empty() => {
                let mut messages: Vec<Message> = decode_all(&docs, "message");
                messages.reverse();
                return messages;
            }
            Ok(_) => {}
            Err(e) => warn!("Sequence preview query for room {} failed: {}", room_id, e),
        }

        let by_time = Query::collection(collection)
            .order_by(paths::SENT_AT, Direction::Descending)
            .limit(n);
        match self.store.query(&by_time).await {
            Ok(docs) => {
                let mut messages: Vec<Message> = decode_all(&docs, "message");
                messages.reverse();
                messages
            }
            Err(e) => {
                warn!("Preview query for room {} failed: {}", room_id, e);
                Vec::new()
            }
        }
    }

    /// Replace a cached room, keeping its previews. Rooms outside the
    /// cached page are not inserted. Returns whether an entry was replaced.
    pub async fn apply_local_update(&self, room: Room) -> bool {
        let mut cache = self.cache.lock().await;
        match cache.iter_mut().find(|entry| entry.room.id == room.id) {
            Some(entry) => {
                entry.room = room;
                true
            }
            None => {
                debug!("Room {} not in cached page, update ignored", room.id);
                false
            }
        }
    }

    pub async fn edit_room(&self, room_id: &RoomId, edit: RoomEdit) -> Result<(), SyncError> {
        let fields = edit.fields()?;
        if fields.is_empty() {
            return Ok(());
        }
        match self.store.update(&paths::room(room_id), fields).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Err(SyncError::RoomNotFound(room_id.clone())),
            Err(e) => return Err(e.into()),
        }

        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.iter_mut().find(|entry| &entry.room.id == room_id) {
            edit.apply(&mut entry.room);
        }
        Ok(())
    }

    pub async fn cached_entries(&self) -> Vec<RoomEntry> {
        self.cache.lock().await.clone()
    }
}

#[async_trait]
impl ActivityRecorder for RoomDirectory {
    /// Move the room's last-message fields forward in the store and in the
    /// cached page. `lastMessageSeq` belongs to message persistence and is
    /// left alone.
    async fn record_activity(&self, room_id: &RoomId, message: &Message) {
        let fields = vec![
            (paths::LAST_MESSAGE.to_string(), FieldValue::Set(json!(message.preview_text()))),
            (
                paths::LAST_MESSAGE_AT.to_string(),
                FieldValue::Set(json!(message.sent_at.timestamp_millis())),
            ),
        ];
        if let Err(e) = self.store.update(&paths::room(room_id), fields).await {
            warn!("Recording activity for room {} failed: {}", room_id, e);
        }

        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.iter_mut().find(|entry| &entry.room.id == room_id) {
            entry.room.last_message = Some(message.preview_text());
            entry.room.last_message_at = Some(message.sent_at);
            if !entry.previews.iter().any(|m| m.id == message.id) {
                entry.previews.push(message.clone());
                let excess = entry.previews.len().saturating_sub(self.preview_count);
                entry.previews.drain(..excess);
            }
        }
        cache.sort_by(|a, b| b.room.last_activity().cmp(&a.room.last_activity()));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tether_store::{DocumentPath, MemoryStore, WriteBatch};

    use super::*;

    fn room_doc(id: &str, last_at: i64) -> (DocumentPath, Value) {
        (
            DocumentPath::new(paths::ROOMS, id),
            json!({
                "name": id,
                "creatorId": "u1",
                "createdAt": 1,
                "participants": ["u1"],
                "lastMessageAt": last_at,
            }),
        )
    }

    async fn seeded(rooms: &[(&str, i64)]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        for (id, at) in rooms {
            let (path, data) = room_doc(id, *at);
            batch = batch.set(path, data);
        }
        store.commit(batch).await.unwrap();
        store
    }

    #[tokio::test]
    async fn zero_page_size_is_rejected() {
        let store = seeded(&[]).await;
        let directory = RoomDirectory::new(store, 3);
        assert!(matches!(
            directory.fetch_top_rooms_page(None, 0).await,
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn pages_follow_activity_and_end_on_short_page() {
        let store = seeded(&[("a", 100), ("b", 300), ("c", 200)]).await;
        let directory = RoomDirectory::new(store, 3);

        let first = directory.fetch_top_rooms_page(None, 2).await.unwrap();
        let ids: Vec<_> = first.entries.iter().map(|e| e.room.id.to_string()).collect();
        assert_eq!(ids, ["b", "c"]);
        assert!(first.next_cursor.is_some());

        let second = directory.fetch_top_rooms_page(first.next_cursor, 2).await.unwrap();
        let ids: Vec<_> = second.entries.iter().map(|e| e.room.id.to_string()).collect();
        assert_eq!(ids, ["a"]);
        assert!(second.next_cursor.is_none());

        // cache holds only the latest page
        assert_eq!(directory.cached_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn local_update_keeps_previews_and_skips_unknown_rooms() {
        let store = seeded(&[("a", 100)]).await;
        store
            .set(
                &DocumentPath::new("rooms/a/messages", "m1"),
                json!({ "roomId": "a", "senderId": "u1", "text": "hi", "seq": 1, "sentAt": 10 }),
            )
            .await
            .unwrap();
        let directory = RoomDirectory::new(store, 3);
        let page = directory.fetch_top_rooms_page(None, 30).await.unwrap();
        assert_eq!(page.entries[0].previews.len(), 1);

        let mut renamed = page.entries[0].room.clone();
        renamed.name = "renamed".into();
        assert!(directory.apply_local_update(renamed).await);

        let mut stranger = page.entries[0].room.clone();
        stranger.id = RoomId::from("zzz");
        assert!(!directory.apply_local_update(stranger).await);

        let cached = directory.cached_entries().await;
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].room.name, "renamed");
        assert_eq!(cached[0].previews.len(), 1);
    }

    #[tokio::test]
    async fn edit_of_missing_room_is_typed() {
        let store = seeded(&[]).await;
        let directory = RoomDirectory::new(store, 3);
        let edit = RoomEdit {
            name: Some("x".into()),
            ..RoomEdit::default()
        };
        assert!(matches!(
            directory.edit_room(&RoomId::from("nope"), edit).await,
            Err(SyncError::RoomNotFound(_))
        ));
    }
}
