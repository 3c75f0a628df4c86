use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tether_types::{Message, Room, RoomId};
use tracing::{debug, warn};

use crate::models::{MediaPathRow, MessageRow, RoomRow};
use crate::Database;

/// Device-local persistence consulted before the network. Callers treat
/// every failure here as non-fatal.
#[async_trait]
pub trait LocalCache: Send + Sync + 'static {
    async fn store_messages(&self, room_id: &RoomId, messages: &[Message]) -> Result<()>;

    async fn store_rooms(&self, rooms: &[Room]) -> Result<()>;

    /// Up to `limit` of the newest cached messages, oldest first.
    async fn cached_messages(&self, room_id: &RoomId, limit: usize) -> Result<Vec<Message>>;

    /// Drop the room, its messages and any local media paths.
    async fn forget_room(&self, room_id: &RoomId) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteCache {
    db: Arc<Database>,
}

impl SqliteCache {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?
    }
}

const LOCAL_PREFIX: &str = "file://";

fn message_rows(room_id: &RoomId, messages: &[Message]) -> Result<(Vec<MessageRow>, Vec<MediaPathRow>)> {
    let mut rows = Vec::with_capacity(messages.len());
    let mut media = Vec::new();

    for message in messages {
        if &message.room_id != room_id {
            warn!(
                "Not caching message {} for room {} under room {}",
                message.id, message.room_id, room_id
            );
            continue;
        }
        rows.push(MessageRow {
            id: message.id.to_string(),
            room_id: room_id.to_string(),
            seq: message.seq,
            sent_at: message.sent_at.timestamp_millis(),
            body: serde_json::to_string(message)?,
        });
        for att in &message.attachments {
            if let Some(path) = att.original.strip_prefix(LOCAL_PREFIX) {
                media.push(MediaPathRow {
                    message_id: message.id.to_string(),
                    idx: att.index,
                    room_id: room_id.to_string(),
                    local_path: path.to_string(),
                });
            }
        }
    }

    Ok((rows, media))
}

fn room_row(room: &Room) -> Result<RoomRow> {
    Ok(RoomRow {
        id: room.id.to_string(),
        name: room.name.clone(),
        last_message_at: room.last_message_at.map(|t| t.timestamp_millis()),
        body: serde_json::to_string(room)?,
    })
}

#[async_trait]
impl LocalCache for SqliteCache {
    async fn store_messages(&self, room_id: &RoomId, messages: &[Message]) -> Result<()> {
        let (rows, media) = message_rows(room_id, messages)?;
        if rows.is_empty() {
            return Ok(());
        }
        let count = rows.len();
        self.blocking(move |db| db.upsert_messages(&rows, &media)).await?;
        debug!("Cached {} messages for room {}", count, room_id);
        Ok(())
    }

    async fn store_rooms(&self, rooms: &[Room]) -> Result<()> {
        let rows = rooms.iter().map(room_row).collect::<Result<Vec<_>>>()?;
        self.blocking(move |db| db.upsert_rooms(&rows)).await
    }

    async fn cached_messages(&self, room_id: &RoomId, limit: usize) -> Result<Vec<Message>> {
        let rid = room_id.to_string();
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        let rows = self.blocking(move |db| db.recent_messages(&rid, limit)).await?;

        let mut messages: Vec<Message> = rows
            .into_iter()
            .filter_map(|row| match serde_json::from_str(&row.body) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Skipping unreadable cached message {}: {}", row.id, e);
                    None
                }
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn forget_room(&self, room_id: &RoomId) -> Result<()> {
        let rid = room_id.to_string();
        let removed = self.blocking(move |db| db.delete_room_data(&rid)).await?;
        debug!("Forgot room {} ({} cached messages)", room_id, removed);
        Ok(())
    }
}
