use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use tether_store::{
    ChangeKind, Cursor, Direction, FieldValue, ListenerHandle, Precondition, Query, RemoteStore,
    StoreError, WriteBatch,
};
use tether_types::{Message, MessageId, RoomId};

use crate::decode::{decode_all, decode_one};
use crate::error::SyncError;
use crate::paths;

/// Optimistic sequence assignment gives up after this many conflicts.
const MAX_PERSIST_ATTEMPTS: usize = 8;

/// Ids of messages soft-deleted in one room, until the handle is removed.
pub struct DeletionWatch {
    pub handle: ListenerHandle,
    pub deleted: mpsc::UnboundedReceiver<MessageId>,
}

/// Paged and anchored reads of a room's history, plus the writes that
/// keep sequence numbers dense.
pub struct MessageSyncEngine {
    store: Arc<dyn RemoteStore>,
    cursors: Mutex<HashMap<RoomId, Cursor>>,
}

impl MessageSyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Next page of the room in ascending sequence order. `reset` starts
    /// over from the first message.
    pub async fn fetch_page(
        &self,
        room_id: &RoomId,
        page_size: usize,
        reset: bool,
    ) -> Result<Vec<Message>, SyncError> {
        if page_size == 0 {
            return Err(SyncError::InvalidArgument("page size must be positive".into()));
        }

        let cursor = {
            let mut cursors = self.cursors.lock().await;
            if reset {
                cursors.remove(room_id);
            }
            cursors.get(room_id).cloned()
        };

        let query = Query::collection(paths::messages(room_id))
            .order_by(paths::SEQ, Direction::Ascending)
            .start_after(cursor)
            .limit(page_size);
        let docs = self.store.query(&query).await?;

        if let Some(last) = docs.last() {
            self.cursors
                .lock()
                .await
                .insert(room_id.clone(), Cursor::after(last));
        }
        Ok(decode_all(&docs, "message"))
    }

    async fn anchor(&self, room_id: &RoomId, id: &MessageId) -> Result<Option<Message>, SyncError> {
        let Some(doc) = self.store.get(&paths::message(room_id, id)).await? else {
            debug!("Anchor message {} not found in room {}", id, room_id);
            return Ok(None);
        };
        Ok(decode_one(&doc, "message"))
    }

    /// Up to `limit` messages immediately before `before`, oldest first.
    /// Sequence order when the anchor has a sequence number, sent time
    /// otherwise. A missing anchor yields an empty list.
    pub async fn fetch_older(
        &self,
        room_id: &RoomId,
        before: &MessageId,
        limit: usize,
    ) -> Result<Vec<Message>, SyncError> {
        if limit == 0 {
            return Err(SyncError::InvalidArgument("limit must be positive".into()));
        }
        let Some(anchor) = self.anchor(room_id, before).await? else {
            return Ok(Vec::new());
        };

        let collection = Query::collection(paths::messages(room_id));
        let query = match anchor.seq {
            Some(seq) => collection
                .where_lt(paths::SEQ, seq)
                .order_by(paths::SEQ, Direction::Descending),
            None => collection
                .where_lt(paths::SENT_AT, anchor.sent_at.timestamp_millis())
                .order_by(paths::SENT_AT, Direction::Descending),
        }
        .limit(limit);

        let docs = self.store.query(&query).await?;
        let mut messages: Vec<Message> = decode_all(&docs, "message");
        messages.reverse();
        Ok(messages)
    }

    /// Up to `limit` messages immediately after `after`, oldest first.
    pub async fn fetch_newer(
        &self,
        room_id: &RoomId,
        after: &MessageId,
        limit: usize,
    ) -> Result<Vec<Message>, SyncError> {
        if limit == 0 {
            return Err(SyncError::InvalidArgument("limit must be positive".into()));
        }
        let Some(anchor) = self.anchor(room_id, after).await? else {
            return Ok(Vec::new());
        };

        let collection = Query::collection(paths::messages(room_id));
        let query = match anchor.seq {
            Some(seq) => collection
                .where_gt(paths::SEQ, seq)
                .order_by(paths::SEQ, Direction::Ascending),
            None => collection
                .where_gt(paths::SENT_AT, anchor.sent_at.timestamp_millis())
                .order_by(paths::SENT_AT, Direction::Ascending),
        }
        .limit(limit);

        let docs = self.store.query(&query).await?;
        Ok(decode_all(&docs, "message"))
    }

    /// Store an accepted message and advance the room's last-message
    /// fields in one commit. A message without a sequence number gets the
    /// room's next one. Persisting an id that is already stored returns the
    /// stored copy unchanged.
    pub async fn persist(&self, message: &Message) -> Result<Message, SyncError> {
        let path = paths::message(&message.room_id, &message.id);
        let room_path = paths::room(&message.room_id);

        for attempt in 1..=MAX_PERSIST_ATTEMPTS {
            if let Some(existing) = self.store.get_fresh(&path).await? {
                if let Some(stored) = decode_one::<Message>(&existing, "message") {
                    debug!("Message {} already persisted", message.id);
                    return Ok(stored);
                }
            }

            let Some(room) = self.store.get_fresh(&room_path).await? else {
                return Err(SyncError::RoomNotFound(message.room_id.clone()));
            };
            let current = room.field(paths::LAST_MESSAGE_SEQ).and_then(Value::as_i64);

            let mut stored = message.clone();
            stored.failed = false;
            let seq = *stored.seq.get_or_insert(current.unwrap_or(0) + 1);
            let body = serde_json::to_value(&stored).map_err(StoreError::from)?;

            let batch = WriteBatch::new()
                .require(Precondition::Missing(path.clone()))
                .require(Precondition::FieldEquals {
                    path: room_path.clone(),
                    field: paths::LAST_MESSAGE_SEQ.into(),
                    value: current.map(Value::from).unwrap_or(Value::Null),
                })
                .set(path.clone(), body)
                .update(
                    room_path.clone(),
                    vec![
                        (
                            paths::LAST_MESSAGE_SEQ.into(),
                            FieldValue::Set(json!(seq.max(current.unwrap_or(0)))),
                        ),
                        (paths::LAST_MESSAGE.into(), FieldValue::Set(json!(stored.preview_text()))),
                        (
                            paths::LAST_MESSAGE_AT.into(),
                            FieldValue::Set(json!(stored.sent_at.timestamp_millis())),
                        ),
                    ],
                );

            match self.store.commit(batch).await {
                Ok(()) => {
                    debug!("Persisted message {} as seq {}", stored.id, seq);
                    return Ok(stored);
                }
                Err(e) if e.is_conflict() => {
                    debug!("Sequence conflict persisting {} (attempt {})", message.id, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!("Gave up persisting message {} after {} conflicts", message.id, MAX_PERSIST_ATTEMPTS);
        Err(SyncError::Store(StoreError::PreconditionFailed(format!(
            "no free sequence number for message {}",
            message.id
        ))))
    }

    /// Mark a message deleted and drop its content. Returns false when the
    /// message does not exist.
    pub async fn soft_delete(&self, room_id: &RoomId, message_id: &MessageId) -> Result<bool, SyncError> {
        let fields = vec![
            (paths::DELETED.to_string(), FieldValue::Set(json!(true))),
            ("text".to_string(), FieldValue::Delete),
            ("attachments".to_string(), FieldValue::Delete),
        ];
        match self.store.update(&paths::message(room_id, message_id), fields).await {
            Ok(()) => {
                debug!("Soft-deleted message {} in room {}", message_id, room_id);
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Follow soft deletions in a room. Messages already deleted are
    /// reported first.
    pub async fn watch_deletions(&self, room_id: &RoomId) -> Result<DeletionWatch, SyncError> {
        let query = Query::collection(paths::messages(room_id)).where_eq(paths::DELETED, true);
        let listener = self.store.listen(&query).await?;

        let (tx, deleted) = mpsc::unbounded_channel();
        let mut changes = listener.changes;
        tokio::spawn(async move {
            while let Some(batch) = changes.recv().await {
                for change in batch {
                    if change.kind == ChangeKind::Removed {
                        continue;
                    }
                    if tx.send(MessageId::from(change.document.id())).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(DeletionWatch {
            handle: listener.handle,
            deleted,
        })
    }
}
