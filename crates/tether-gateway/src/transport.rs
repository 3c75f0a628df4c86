use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_types::events::{
    self, Ack, AttachmentsPayload, RoomEventKind, RoomRequest, DISCONNECT, JOIN_ROOM, LEAVE_ROOM,
};
use tether_types::media::{self, LocalMedia};
use tether_types::normalize::normalize_message;
use tether_types::{Author, Message, RoomId};

use crate::connection::{Connection, EventListener, SubscriptionId};
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub text_ack_timeout: Duration,
    pub attachment_ack_timeout: Duration,
    /// Per-room fan-out buffer; slower subscribers skip ahead past this.
    pub room_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            text_ack_timeout: Duration::from_secs(5),
            attachment_ack_timeout: Duration::from_secs(15),
            room_buffer: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Delivered {
        message: Message,
        seq: Option<i64>,
        /// The server had already accepted this message id.
        duplicate: bool,
    },
    /// `message` is the failure-flagged copy that was published locally.
    Failed { message: Message, reason: String },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn message(&self) -> &Message {
        match self {
            Self::Delivered { message, .. } | Self::Failed { message, .. } => message,
        }
    }
}

/// Told about every message the server accepted, so the room list can
/// move the room to the top without waiting for the store.
#[async_trait]
pub trait ActivityRecorder: Send + Sync + 'static {
    async fn record_activity(&self, room_id: &RoomId, message: &Message);
}

/// Live messages for one room. Ends when the last subscriber of the room
/// unsubscribes.
pub struct RoomStream {
    room_id: RoomId,
    rx: broadcast::Receiver<Message>,
}

impl RoomStream {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(n)) => {
                    warn!("Room {} stream lagged by {} messages", self.room_id, n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Owns the realtime connection: connection state, room membership,
/// per-room fan-out and acknowledged sends.
#[derive(Clone)]
pub struct RealtimeTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    connection: Arc<dyn Connection>,
    config: TransportConfig,
    recorder: Option<Arc<dyn ActivityRecorder>>,
    link: Mutex<LinkState>,
    rooms: Mutex<HashMap<RoomId, RoomSubject>>,
}

struct LinkState {
    state: ConnectionState,
    waiters: Vec<oneshot::Sender<Result<(), GatewayError>>>,
    pending_joins: VecDeque<RoomId>,
    joined: HashSet<RoomId>,
    /// Bumped on every connect and close so a stale disconnect is ignored.
    epoch: u64,
    disconnect_watch: Option<(SubscriptionId, JoinHandle<()>)>,
}

struct RoomSubject {
    subscribers: usize,
    tx: broadcast::Sender<Message>,
    listeners: Vec<SubscriptionId>,
    pumps: Vec<JoinHandle<()>>,
}

impl RealtimeTransport {
    pub fn new(
        connection: Arc<dyn Connection>,
        config: TransportConfig,
        recorder: Option<Arc<dyn ActivityRecorder>>,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                connection,
                config,
                recorder,
                link: Mutex::new(LinkState {
                    state: ConnectionState::Disconnected,
                    waiters: Vec::new(),
                    pending_joins: VecDeque::new(),
                    joined: HashSet::new(),
                    epoch: 0,
                    disconnect_watch: None,
                }),
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.link.lock().await.state
    }

    pub async fn is_joined(&self, room_id: &RoomId) -> bool {
        self.inner.link.lock().await.joined.contains(room_id)
    }

    pub async fn pending_joins(&self) -> Vec<RoomId> {
        self.inner.link.lock().await.pending_joins.iter().cloned().collect()
    }

    pub async fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.inner
            .rooms
            .lock()
            .await
            .get(room_id)
            .map_or(0, |s| s.subscribers)
    }

    // -- Connection lifecycle --

    /// Connect, or wait for the attempt already in flight. Every caller of
    /// one attempt sees the same outcome.
    ///
    /// The attempt runs on its own task, so dropping a caller mid-connect
    /// leaves the attempt and the other waiters unaffected.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut link = self.inner.link.lock().await;
            match link.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => link.waiters.push(tx),
                ConnectionState::Disconnected => {
                    link.state = ConnectionState::Connecting;
                    link.waiters.push(tx);
                    let transport = self.clone();
                    tokio::spawn(async move { transport.run_attempt().await });
                }
            }
        }
        rx.await.unwrap_or(Err(GatewayError::Closed))
    }

    async fn run_attempt(&self) {
        let result = self.establish().await;
        let waiters = {
            let mut link = self.inner.link.lock().await;
            if result.is_err() {
                link.state = ConnectionState::Disconnected;
            }
            std::mem::take(&mut link.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    async fn establish(&self) -> Result<(), GatewayError> {
        // Subscribe before opening so a drop right after open is seen.
        let disconnects = self.inner.connection.on(DISCONNECT);
        let listener_id = disconnects.id;
        if let Err(e) = self.inner.connection.open().await {
            self.inner.connection.off(listener_id);
            warn!("Gateway connect failed: {}", e);
            return Err(e);
        }

        let to_join: Vec<RoomId> = {
            let mut link = self.inner.link.lock().await;
            link.state = ConnectionState::Connected;
            link.epoch += 1;
            let watch = spawn_disconnect_watch(Arc::downgrade(&self.inner), disconnects, link.epoch);
            if let Some((old_id, old)) = link.disconnect_watch.replace((listener_id, watch)) {
                self.inner.connection.off(old_id);
                old.abort();
            }
            let rooms: Vec<RoomId> = link.pending_joins.drain(..).collect();
            for room in &rooms {
                link.joined.insert(room.clone());
            }
            rooms
        };

        info!("Gateway connected, flushing {} pending joins", to_join.len());
        for room in to_join {
            if let Err(e) = self.emit_join(&room).await {
                warn!("Join of room {} failed, requeued: {}", room, e);
                let mut link = self.inner.link.lock().await;
                link.joined.remove(&room);
                if !link.pending_joins.contains(&room) {
                    link.pending_joins.push_back(room);
                }
            }
        }
        Ok(())
    }

    async fn handle_drop(&self, epoch: u64) {
        let mut link = self.inner.link.lock().await;
        if link.epoch != epoch || link.state != ConnectionState::Connected {
            return;
        }
        link.state = ConnectionState::Disconnected;
        let rooms: Vec<RoomId> = link.joined.drain().collect();
        for room in rooms {
            if !link.pending_joins.contains(&room) {
                link.pending_joins.push_back(room);
            }
        }
        warn!(
            "Gateway connection lost, {} rooms queued for re-join",
            link.pending_joins.len()
        );
    }

    pub async fn close(&self) {
        {
            let mut link = self.inner.link.lock().await;
            link.state = ConnectionState::Disconnected;
            link.epoch += 1;
            if let Some((id, watch)) = link.disconnect_watch.take() {
                self.inner.connection.off(id);
                watch.abort();
            }
            let rooms: Vec<RoomId> = link.joined.drain().collect();
            for room in rooms {
                if !link.pending_joins.contains(&room) {
                    link.pending_joins.push_back(room);
                }
            }
        }
        self.inner.connection.close().await;
        info!("Gateway closed");
    }

    // -- Membership --

    async fn emit_join(&self, room_id: &RoomId) -> Result<(), GatewayError> {
        let payload = room_request(room_id)?;
        self.inner.connection.emit(JOIN_ROOM, payload).await?;
        debug!("Joined room {}", room_id);
        Ok(())
    }

    /// Join a room's broadcast group. At most one join is emitted per room
    /// per connection; while disconnected the room is queued for the next
    /// `connect()`.
    pub async fn join_room(&self, room_id: &RoomId) -> Result<(), GatewayError> {
        {
            let mut link = self.inner.link.lock().await;
            if link.joined.contains(room_id) || link.pending_joins.contains(room_id) {
                debug!("Room {} already joined or queued", room_id);
                return Ok(());
            }
            if link.state != ConnectionState::Connected {
                link.pending_joins.push_back(room_id.clone());
                debug!("Queued join for room {}", room_id);
                return Ok(());
            }
            // Reserved before the emit so a concurrent join is a no-op.
            link.joined.insert(room_id.clone());
        }

        if let Err(e) = self.emit_join(room_id).await {
            self.inner.link.lock().await.joined.remove(room_id);
            return Err(e);
        }
        Ok(())
    }

    pub async fn leave_room(&self, room_id: &RoomId) -> Result<(), GatewayError> {
        let emit = {
            let mut link = self.inner.link.lock().await;
            link.pending_joins.retain(|r| r != room_id);
            link.joined.remove(room_id) && link.state == ConnectionState::Connected
        };
        if emit {
            let payload = room_request(room_id)?;
            self.inner.connection.emit(LEAVE_ROOM, payload).await?;
            debug!("Left room {}", room_id);
        }
        Ok(())
    }

    // -- Fan-out --

    /// Subscribe to a room's live messages. The first subscriber attaches
    /// the room's event listeners and joins the room.
    pub async fn subscribe(&self, room_id: &RoomId) -> RoomStream {
        let (rx, first) = {
            let mut rooms = self.inner.rooms.lock().await;
            match rooms.get_mut(room_id) {
                Some(subject) => {
                    subject.subscribers += 1;
                    (subject.tx.subscribe(), false)
                }
                None => {
                    let (tx, rx) = broadcast::channel(self.inner.config.room_buffer.max(1));
                    let mut listeners = Vec::with_capacity(RoomEventKind::ALL.len());
                    let mut pumps = Vec::with_capacity(RoomEventKind::ALL.len());
                    for kind in RoomEventKind::ALL {
                        let listener = self.inner.connection.on(kind.event_name());
                        listeners.push(listener.id);
                        pumps.push(tokio::spawn(pump(room_id.clone(), kind, listener.events, tx.clone())));
                    }
                    rooms.insert(
                        room_id.clone(),
                        RoomSubject {
                            subscribers: 1,
                            tx,
                            listeners,
                            pumps,
                        },
                    );
                    (rx, true)
                }
            }
        };

        if first {
            debug!("Opened stream for room {}", room_id);
            if let Err(e) = self.join_room(room_id).await {
                warn!("Join of room {} failed: {}", room_id, e);
            }
        }

        RoomStream {
            room_id: room_id.clone(),
            rx,
        }
    }

    /// Drop one subscription. The last one detaches the listeners and ends
    /// every outstanding [`RoomStream`] of the room.
    pub async fn unsubscribe(&self, room_id: &RoomId) {
        let removed = {
            let mut rooms = self.inner.rooms.lock().await;
            let Some(subject) = rooms.get_mut(room_id) else {
                debug!("Unsubscribe from room {} with no subscribers", room_id);
                return;
            };
            subject.subscribers -= 1;
            if subject.subscribers > 0 {
                return;
            }
            rooms.remove(room_id)
        };

        if let Some(subject) = removed {
            for id in subject.listeners {
                self.inner.connection.off(id);
            }
            for pump in subject.pumps {
                pump.abort();
            }
            debug!("Closed stream for room {}", room_id);
        }
    }

    /// Publish a locally produced message to the room's subscribers.
    async fn publish(&self, message: &Message) {
        let rooms = self.inner.rooms.lock().await;
        if let Some(subject) = rooms.get(&message.room_id) {
            let _ = subject.tx.send(message.clone());
        }
    }

    // -- Sending --

    /// Send a message and wait for the server's ack. Any failure publishes
    /// the failure-flagged copy to the room's subscribers.
    pub async fn send(&self, room_id: &RoomId, message: Message) -> SendOutcome {
        let message = bind_room(room_id, message);
        let timeout = if message.has_attachments() {
            self.inner.config.attachment_ack_timeout
        } else {
            self.inner.config.text_ack_timeout
        };
        let payload = serde_json::to_value(&message);
        self.deliver(message, events::SEND_MESSAGE, payload, timeout).await
    }

    /// Like [`RealtimeTransport::send`] for media already persisted out of
    /// band: the payload carries only the attachment metadata.
    pub async fn send_attachments_meta(&self, room_id: &RoomId, message: Message) -> SendOutcome {
        let message = bind_room(room_id, message);
        let payload = serde_json::to_value(AttachmentsPayload::from(&message));
        let timeout = self.inner.config.attachment_ack_timeout;
        self.deliver(message, events::SEND_ATTACHMENTS, payload, timeout).await
    }

    async fn deliver(
        &self,
        message: Message,
        event: &str,
        payload: Result<Value, serde_json::Error>,
        timeout: Duration,
    ) -> SendOutcome {
        if self.state().await != ConnectionState::Connected {
            return self.fail(message, "not connected").await;
        }
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => return self.fail(message, format!("unencodable message: {}", e)).await,
        };

        let reply = match self.inner.connection.emit_with_ack(event, payload, timeout).await {
            Ok(reply) => reply,
            Err(e) => return self.fail(message, e.to_string()).await,
        };
        let ack: Ack = match serde_json::from_value(reply) {
            Ok(ack) => ack,
            Err(e) => return self.fail(message, format!("unreadable ack: {}", e)).await,
        };
        if !ack.is_accepted() {
            let reason = ack.error.unwrap_or_else(|| "rejected".to_string());
            return self.fail(message, reason).await;
        }

        let mut delivered = message;
        if delivered.seq.is_none() {
            delivered.seq = ack.seq;
        }
        if ack.duplicate {
            debug!("Message {} was already accepted", delivered.id);
        }
        if let Some(recorder) = &self.inner.recorder {
            recorder.record_activity(&delivered.room_id, &delivered).await;
        }
        SendOutcome::Delivered {
            message: delivered,
            seq: ack.seq,
            duplicate: ack.duplicate,
        }
    }

    async fn fail(&self, message: Message, reason: impl Into<String>) -> SendOutcome {
        let reason = reason.into();
        warn!("Send of message {} to room {} failed: {}", message.id, message.room_id, reason);
        let failed = message.failed_copy();
        self.publish(&failed).await;
        SendOutcome::Failed {
            message: failed,
            reason,
        }
    }

    /// Build a failure-flagged message for media that never left the device
    /// and show it to the room's subscribers.
    pub async fn synthesize_failed_attachment(
        &self,
        room_id: &RoomId,
        sender: &Author,
        files: &[LocalMedia],
        caption: Option<String>,
    ) -> Message {
        let room = room_id.clone();
        let author = sender.clone();
        let files = files.to_vec();
        // Hashing reads whole files; keep it off the async workers.
        let message = match tokio::task::spawn_blocking(move || {
            media::synthesize_failed_attachment(&room, &author, &files, caption)
        })
        .await
        {
            Ok(message) => message,
            Err(e) => {
                warn!("spawn_blocking join error: {}", e);
                let mut message = Message::text(room_id.clone(), sender, String::new());
                message.text = None;
                message.failed_copy()
            }
        };
        self.publish(&message).await;
        message
    }
}

fn room_request(room_id: &RoomId) -> Result<Value, GatewayError> {
    serde_json::to_value(RoomRequest {
        room_id: room_id.clone(),
    })
    .map_err(|e| GatewayError::Protocol(e.to_string()))
}

fn bind_room(room_id: &RoomId, mut message: Message) -> Message {
    if &message.room_id != room_id {
        warn!(
            "Message {} addressed to room {} sent via room {}",
            message.id, message.room_id, room_id
        );
        message.room_id = room_id.clone();
    }
    message
}

fn spawn_disconnect_watch(
    inner: Weak<TransportInner>,
    mut listener: EventListener,
    epoch: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if listener.events.recv().await.is_some() {
            if let Some(inner) = inner.upgrade() {
                RealtimeTransport { inner }.handle_drop(epoch).await;
            }
        }
    })
}

async fn pump(
    room_id: RoomId,
    kind: RoomEventKind,
    mut events: mpsc::UnboundedReceiver<Value>,
    tx: broadcast::Sender<Message>,
) {
    while let Some(payload) = events.recv().await {
        let message = match normalize_message(&payload, kind) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed {} payload: {}", kind.event_name(), e);
                continue;
            }
        };
        if message.room_id != room_id {
            continue;
        }
        let _ = tx.send(message);
    }
}
