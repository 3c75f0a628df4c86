use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SubsecRound, Utc};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_db::LocalCache;
use tether_store::{FieldValue, Precondition, RemoteStore, StoreError, WriteBatch};
use tether_types::{Room, RoomId, UserId};

use crate::decode::decode_one;
use crate::error::SyncError;
use crate::paths;

const MAX_LEAVE_ATTEMPTS: usize = 5;

/// Fields of a room being created.
#[derive(Debug, Clone, Default)]
pub struct NewRoom {
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// Keeps `rooms/{r}.participants` and `users/{u}.joinedRooms` in step.
/// Every change to one side is committed together with the other.
pub struct ParticipantLedger {
    store: Arc<dyn RemoteStore>,
    cache: Option<Arc<dyn LocalCache>>,
    /// Pending membership change per user.
    pending: Mutex<HashMap<UserId, (u64, CancellationToken)>>,
    next_op: AtomicU64,
}

impl ParticipantLedger {
    pub fn new(store: Arc<dyn RemoteStore>, cache: Option<Arc<dyn LocalCache>>) -> Self {
        Self {
            store,
            cache,
            pending: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(0),
        }
    }

    /// Run `op` as the user's current membership change. A later call for
    /// the same user cancels this one.
    async fn exclusive<T, Fut>(&self, user: &UserId, op: Fut) -> Result<T, SyncError>
    where
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut pending = self.pending.lock().await;
            if let Some((previous, old)) = pending.insert(user.clone(), (id, token.clone())) {
                debug!("Membership change {} for {} superseded by {}", previous, user, id);
                old.cancel();
            }
        }

        let result = tokio::select! {
            _ = token.cancelled() => Err(SyncError::Superseded),
            result = op => result,
        };

        let mut pending = self.pending.lock().await;
        if pending.get(user).is_some_and(|(current, _)| *current == id) {
            pending.remove(user);
        }
        result
    }

    /// Add `user` to `room_id` and return the room as the store now has it.
    pub async fn join(&self, user: &UserId, room_id: &RoomId) -> Result<Room, SyncError> {
        self.exclusive(user, self.join_inner(user, room_id)).await
    }

    async fn join_inner(&self, user: &UserId, room_id: &RoomId) -> Result<Room, SyncError> {
        let room_path = paths::room(room_id);
        let batch = WriteBatch::new()
            .require(Precondition::Exists(room_path.clone()))
            .upsert(
                paths::user(user),
                vec![(paths::JOINED_ROOMS.into(), FieldValue::ArrayUnion(vec![json!(room_id)]))],
            )
            .update(
                room_path.clone(),
                vec![(paths::PARTICIPANTS.into(), FieldValue::ArrayUnion(vec![json!(user)]))],
            );

        match self.store.commit(batch).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Err(SyncError::RoomNotFound(room_id.clone())),
            Err(e) => return Err(e.into()),
        }
        info!("{} joined room {}", user, room_id);

        let doc = self
            .store
            .get_fresh(&room_path)
            .await?
            .ok_or_else(|| SyncError::RoomNotFound(room_id.clone()))?;
        doc.decode().map_err(|e| SyncError::Store(StoreError::from(e)))
    }

    /// Remove `user` from `room_id`. The last participant cannot leave.
    pub async fn leave(&self, user: &UserId, room_id: &RoomId) -> Result<(), SyncError> {
        self.exclusive(user, self.leave_inner(user, room_id)).await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.forget_room(room_id).await {
                warn!("Failed to clear local data for room {}: {}", room_id, e);
            }
        }
        Ok(())
    }

    async fn leave_inner(&self, user: &UserId, room_id: &RoomId) -> Result<(), SyncError> {
        let room_path = paths::room(room_id);
        let user_path = paths::user(user);
        let member = json!(user);

        for attempt in 1..=MAX_LEAVE_ATTEMPTS {
            let doc = self
                .store
                .get_fresh(&room_path)
                .await?
                .ok_or_else(|| SyncError::RoomNotFound(room_id.clone()))?;
            let participants = doc.field(paths::PARTICIPANTS).cloned().unwrap_or(Value::Null);
            let members = participants.as_array().map(Vec::as_slice).unwrap_or_default();

            let mut batch = WriteBatch::new().upsert(
                user_path.clone(),
                vec![(paths::JOINED_ROOMS.into(), FieldValue::ArrayRemove(vec![json!(room_id)]))],
            );
            if members.contains(&member) {
                if members.len() == 1 {
                    return Err(SyncError::LastParticipant {
                        user: user.clone(),
                        room: room_id.clone(),
                    });
                }
                batch = batch
                    .require(Precondition::FieldEquals {
                        path: room_path.clone(),
                        field: paths::PARTICIPANTS.into(),
                        value: participants.clone(),
                    })
                    .update(
                        room_path.clone(),
                        vec![(paths::PARTICIPANTS.into(), FieldValue::ArrayRemove(vec![member.clone()]))],
                    );
            } else {
                debug!("{} is not a participant of {}, clearing joinedRooms only", user, room_id);
            }

            match self.store.commit(batch).await {
                Ok(()) => {
                    info!("{} left room {}", user, room_id);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!("Participants of {} changed during leave (attempt {})", room_id, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SyncError::Store(StoreError::PreconditionFailed(format!(
            "participants of room {} kept changing",
            room_id
        ))))
    }

    /// Create a room with `creator` as its only participant.
    pub async fn create_room(&self, creator: &UserId, new_room: NewRoom) -> Result<Room, SyncError> {
        let name = new_room.name.trim();
        if name.is_empty() {
            return Err(SyncError::InvalidArgument("room name must not be empty".into()));
        }

        let path = self.store.new_document_path(paths::ROOMS);
        let created_at = Utc::now().trunc_subsecs(3);
        let room = Room {
            id: RoomId::from(path.id()),
            name: name.to_string(),
            description: new_room.description,
            participants: [creator.clone()].into(),
            creator_id: creator.clone(),
            created_at,
            last_message: None,
            last_message_at: Some(created_at),
            last_message_seq: None,
            image_url: new_room.image_url,
            thumbnail_url: new_room.thumbnail_url,
            announcement: None,
        };
        let body = serde_json::to_value(&room).map_err(StoreError::from)?;

        let batch = WriteBatch::new()
            .require(Precondition::Missing(path.clone()))
            .set(path, body)
            .upsert(
                paths::user(creator),
                vec![(paths::JOINED_ROOMS.into(), FieldValue::ArrayUnion(vec![json!(room.id)]))],
            );
        self.store.commit(batch).await?;

        info!("{} created room {} ({})", creator, room.id, room.name);
        Ok(room)
    }

    /// Rooms the user belongs to, from their `joinedRooms` list.
    pub async fn joined_rooms(&self, user: &UserId) -> Result<Vec<RoomId>, SyncError> {
        let Some(doc) = self.store.get(&paths::user(user)).await? else {
            return Ok(Vec::new());
        };
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct UserRooms {
            #[serde(default)]
            joined_rooms: Vec<RoomId>,
        }
        Ok(decode_one::<UserRooms>(&doc, "user")
            .map(|u| u.joined_rooms)
            .unwrap_or_default())
    }
}
