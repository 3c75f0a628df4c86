use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_db::LocalCache;
use tether_gateway::{
    ActivityRecorder, Connection, RealtimeTransport, RoomStream, SendOutcome, TransportConfig,
};
use tether_store::RemoteStore;
use tether_types::{Author, Message, Room, RoomId};

use crate::backoff::Backoff;
use crate::change_stream::RoomChangeStream;
use crate::directory::{DEFAULT_PAGE_SIZE, DEFAULT_PREVIEW_COUNT, RoomDirectory, RoomPage};
use crate::error::SyncError;
use crate::ledger::{NewRoom, ParticipantLedger};
use crate::messages::MessageSyncEngine;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub page_size: usize,
    pub preview_count: usize,
    /// Retry policy for room listener setup.
    pub backoff: Backoff,
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            preview_count: DEFAULT_PREVIEW_COUNT,
            backoff: Backoff::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// An open room: the first page of history and the live message stream.
pub struct RoomView {
    pub history: Vec<Message>,
    pub live: RoomStream,
}

struct EnteredRoom {
    views: usize,
    /// Persists every message the room receives.
    persister: JoinHandle<()>,
}

/// Everything one signed-in user needs, wired together. Sessions share no
/// state with each other.
pub struct ChatSession {
    user: Author,
    config: SessionConfig,
    cache: Option<Arc<dyn LocalCache>>,
    directory: Arc<RoomDirectory>,
    rooms: RoomChangeStream,
    messages: Arc<MessageSyncEngine>,
    ledger: ParticipantLedger,
    transport: RealtimeTransport,
    entered: Mutex<HashMap<RoomId, EnteredRoom>>,
}

impl ChatSession {
    pub fn new(
        user: Author,
        store: Arc<dyn RemoteStore>,
        connection: Arc<dyn Connection>,
        cache: Option<Arc<dyn LocalCache>>,
        config: SessionConfig,
    ) -> Self {
        let directory = Arc::new(RoomDirectory::new(store.clone(), config.preview_count));
        let recorder: Arc<dyn ActivityRecorder> = directory.clone();
        let transport = RealtimeTransport::new(connection, config.transport.clone(), Some(recorder));

        Self {
            user,
            cache: cache.clone(),
            directory,
            rooms: RoomChangeStream::new(store.clone()),
            messages: Arc::new(MessageSyncEngine::new(store.clone())),
            ledger: ParticipantLedger::new(store, cache),
            transport,
            entered: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn user(&self) -> &Author {
        &self.user
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    pub fn room_changes(&self) -> &RoomChangeStream {
        &self.rooms
    }

    pub fn messages(&self) -> &MessageSyncEngine {
        &self.messages
    }

    pub fn ledger(&self) -> &ParticipantLedger {
        &self.ledger
    }

    pub fn transport(&self) -> &RealtimeTransport {
        &self.transport
    }

    // -- Room list --

    /// First page of the room list. The rooms are also written to the local
    /// cache.
    pub async fn refresh_room_list(&self) -> Result<RoomPage, SyncError> {
        let page = self
            .directory
            .fetch_top_rooms_page(None, self.config.page_size)
            .await?;

        if let Some(cache) = &self.cache {
            let rooms: Vec<Room> = page.entries.iter().map(|e| e.room.clone()).collect();
            if let Err(e) = cache.store_rooms(&rooms).await {
                warn!("Failed to cache {} rooms: {}", rooms.len(), e);
            }
        }
        Ok(page)
    }

    /// Watch exactly `room_ids`, retrying listener setup with backoff. A
    /// newer call replacing this one is not an error.
    pub async fn watch_rooms(&self, room_ids: impl IntoIterator<Item = RoomId>) -> Result<(), SyncError> {
        let ids: Vec<RoomId> = room_ids.into_iter().collect();
        self.config
            .backoff
            .retry("Room watch", |_| {
                let ids = ids.clone();
                async move {
                    match self.rooms.watch(ids).await {
                        Err(SyncError::Superseded) => {
                            debug!("Room watch replaced by a newer one");
                            Ok(())
                        }
                        other => other,
                    }
                }
            })
            .await
    }

    // -- Membership --

    /// Join a room, connect the transport and start watching the room.
    pub async fn join_and_connect(&self, room_id: &RoomId) -> Result<Room, SyncError> {
        let room = self.ledger.join(&self.user.id, room_id).await?;
        self.transport.connect().await?;
        self.transport.join_room(room_id).await?;

        if let Err(e) = self.rooms.watch_single(room_id).await {
            warn!("Could not watch room {} after joining: {}", room_id, e);
        }
        self.directory.apply_local_update(room.clone()).await;
        Ok(room)
    }

    pub async fn create_room(&self, new_room: NewRoom) -> Result<Room, SyncError> {
        let room = self.ledger.create_room(&self.user.id, new_room).await?;
        if let Err(e) = self.rooms.watch_single(&room.id).await {
            warn!("Could not watch new room {}: {}", room.id, e);
        }
        Ok(room)
    }

    /// Leave a room and release everything the session holds for it.
    pub async fn leave(&self, room_id: &RoomId) -> Result<(), SyncError> {
        self.ledger.leave(&self.user.id, room_id).await?;

        if let Err(e) = self.transport.leave_room(room_id).await {
            warn!("Leave of room {} not sent: {}", room_id, e);
        }
        if let Some(entered) = self.entered.lock().await.remove(room_id) {
            entered.persister.abort();
            // one subscription per view plus the persister's own
            for _ in 0..=entered.views {
                self.transport.unsubscribe(room_id).await;
            }
        }
        Ok(())
    }

    // -- Messages --

    /// Open a room: load its first page and subscribe to live messages.
    /// Received messages are persisted in the background while the room is
    /// entered. The store being unreachable falls back to the local cache.
    pub async fn enter_room(&self, room_id: &RoomId) -> Result<RoomView, SyncError> {
        let history = match self.messages.fetch_page(room_id, self.config.page_size, true).await {
            Ok(history) => {
                self.cache_messages(room_id, &history).await;
                history
            }
            Err(SyncError::Store(e)) if e.is_transient() => {
                warn!("Room {} history unavailable, using local cache: {}", room_id, e);
                self.cached_history(room_id).await
            }
            Err(e) => return Err(e),
        };

        let mut entered = self.entered.lock().await;
        match entered.get_mut(room_id) {
            Some(room) => room.views += 1,
            None => {
                let stream = self.transport.subscribe(room_id).await;
                let persister = tokio::spawn(persist_received(
                    stream,
                    self.messages.clone(),
                    self.cache.clone(),
                ));
                entered.insert(room_id.clone(), EnteredRoom { views: 1, persister });
            }
        }
        let live = self.transport.subscribe(room_id).await;
        drop(entered);

        info!("Entered room {} with {} messages", room_id, history.len());
        Ok(RoomView { history, live })
    }

    /// Close one view of a room. The last view stops the background
    /// persistence.
    pub async fn exit_room(&self, room_id: &RoomId) {
        let mut entered = self.entered.lock().await;
        let Some(room) = entered.get_mut(room_id) else {
            debug!("Room {} was not entered", room_id);
            return;
        };
        room.views -= 1;
        self.transport.unsubscribe(room_id).await;
        if room.views == 0 {
            if let Some(room) = entered.remove(room_id) {
                room.persister.abort();
                self.transport.unsubscribe(room_id).await;
                debug!("Exited room {}", room_id);
            }
        }
    }

    /// Send a text message from the session's user. Accepted messages are
    /// persisted right away.
    pub async fn send_text(&self, room_id: &RoomId, text: impl Into<String>) -> SendOutcome {
        let message = Message::text(room_id.clone(), &self.user, text);
        let outcome = self.transport.send(room_id, message).await;
        if let SendOutcome::Delivered { message, .. } = &outcome {
            persist_one(&self.messages, self.cache.as_deref(), message).await;
        }
        outcome
    }

    /// Stop every listener and close the connection.
    pub async fn shutdown(&self) {
        for (_, room) in self.entered.lock().await.drain() {
            room.persister.abort();
        }
        self.rooms.stop_all().await;
        self.transport.close().await;
        info!("Session for {} closed", self.user.id);
    }

    async fn cache_messages(&self, room_id: &RoomId, messages: &[Message]) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store_messages(room_id, messages).await {
                warn!("Failed to cache messages for room {}: {}", room_id, e);
            }
        }
    }

    async fn cached_history(&self, room_id: &RoomId) -> Vec<Message> {
        let Some(cache) = &self.cache else {
            return Vec::new();
        };
        match cache.cached_messages(room_id, self.config.page_size).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Local cache read for room {} failed: {}", room_id, e);
                Vec::new()
            }
        }
    }
}

async fn persist_one(engine: &MessageSyncEngine, cache: Option<&dyn LocalCache>, message: &Message) {
    match engine.persist(message).await {
        Ok(stored) => {
            if let Some(cache) = cache {
                if let Err(e) = cache.store_messages(&stored.room_id, &[stored.clone()]).await {
                    warn!("Failed to cache message {}: {}", stored.id, e);
                }
            }
        }
        Err(e) => warn!("Failed to persist message {}: {}", message.id, e),
    }
}

async fn persist_received(
    mut stream: RoomStream,
    engine: Arc<MessageSyncEngine>,
    cache: Option<Arc<dyn LocalCache>>,
) {
    while let Some(message) = stream.recv().await {
        if message.failed {
            continue;
        }
        persist_one(&engine, cache.as_deref(), &message).await;
    }
    debug!("Persister for room {} stopped", stream.room_id());
}
