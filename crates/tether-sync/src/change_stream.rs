use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_store::{
    ChangeKind, DOCUMENT_ID, DocumentChange, ListenerHandle, ListenerId, MAX_IN_VALUES, Query,
    RemoteStore,
};
use tether_types::{Room, RoomId};

use crate::decode::decode_one;
use crate::error::SyncError;
use crate::paths;

const FEED_CAPACITY: usize = 256;

/// Live room documents for a caller-chosen set of rooms, fanned in from
/// one `in` listener per chunk of at most [`MAX_IN_VALUES`] ids.
///
/// Batched and single-room listeners share one table keyed by chunk
/// signature (the sorted, comma-joined ids), so a room is never covered
/// twice.
pub struct RoomChangeStream {
    store: Arc<dyn RemoteStore>,
    feed: broadcast::Sender<Room>,
    state: Mutex<WatchState>,
}

#[derive(Default)]
struct WatchState {
    watched: BTreeSet<RoomId>,
    /// Target of the `watch` whose setup is still running.
    pending: BTreeSet<RoomId>,
    listeners: BTreeMap<String, ActiveListener>,
    setup: Option<CancellationToken>,
    /// Bumped by every `watch` and `stop_all`.
    generation: u64,
}

struct ActiveListener {
    rooms: Vec<RoomId>,
    handle: ListenerHandle,
    pump: JoinHandle<()>,
}

impl ActiveListener {
    fn release(self) {
        self.handle.remove();
        self.pump.abort();
    }
}

impl WatchState {
    fn teardown(&mut self) {
        if let Some(setup) = self.setup.take() {
            setup.cancel();
        }
        for (_, listener) in std::mem::take(&mut self.listeners) {
            listener.release();
        }
        self.watched.clear();
        self.pending.clear();
        self.generation += 1;
    }

    fn covers(&self, room_id: &RoomId) -> bool {
        self.watched.contains(room_id) || self.pending.contains(room_id)
    }
}

pub fn chunk_signature(chunk: &[RoomId]) -> String {
    chunk
        .iter()
        .map(RoomId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

impl RoomChangeStream {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            store,
            feed,
            state: Mutex::new(WatchState::default()),
        }
    }

    /// Added and modified rooms from every active listener.
    pub fn changes(&self) -> broadcast::Receiver<Room> {
        self.feed.subscribe()
    }

    /// Watch exactly `room_ids`. An unchanged set keeps the current
    /// listeners; any change tears everything down and rebuilds. A newer
    /// call cancels the setup of an older one, which returns
    /// [`SyncError::Superseded`].
    pub async fn watch(&self, room_ids: impl IntoIterator<Item = RoomId>) -> Result<(), SyncError> {
        let target: BTreeSet<RoomId> = room_ids.into_iter().collect();

        let (token, generation) = {
            let mut state = self.state.lock().await;
            if state.watched == target && state.setup.is_none() {
                debug!("Watch set unchanged ({} rooms)", target.len());
                return Ok(());
            }
            state.teardown();
            if target.is_empty() {
                info!("Watch set empty, all room listeners stopped");
                return Ok(());
            }
            let token = CancellationToken::new();
            state.setup = Some(token.clone());
            state.pending = target.clone();
            (token, state.generation)
        };

        let ids: Vec<RoomId> = target.into_iter().collect();
        for chunk in ids.chunks(MAX_IN_VALUES) {
            let signature = chunk_signature(chunk);
            let query = Query::collection(paths::ROOMS)
                .where_in(DOCUMENT_ID, chunk.iter().map(|id| id.to_string()));

            let result = tokio::select! {
                _ = token.cancelled() => {
                    debug!("Watch setup for [{}] superseded", signature);
                    return Err(SyncError::Superseded);
                }
                result = self.store.listen(&query) => result,
            };

            let mut state = self.state.lock().await;
            if state.generation != generation {
                if let Ok(listener) = result {
                    listener.handle.remove();
                }
                return Err(SyncError::Superseded);
            }
            let listener = match result {
                Ok(listener) => listener,
                Err(source) => {
                    state.setup = None;
                    state.pending.clear();
                    warn!(
                        "Listener setup for [{}] failed, {} rooms watched: {}",
                        signature,
                        state.watched.len(),
                        source
                    );
                    return Err(SyncError::ListenerSetup { signature, source });
                }
            };

            let pump = tokio::spawn(pump(listener.changes, self.feed.clone()));
            state.watched.extend(chunk.iter().cloned());
            state.listeners.insert(
                signature,
                ActiveListener {
                    rooms: chunk.to_vec(),
                    handle: listener.handle,
                    pump,
                },
            );
        }

        let mut state = self.state.lock().await;
        if state.generation == generation {
            state.setup = None;
            state.pending.clear();
            info!(
                "Watching {} rooms with {} listeners",
                state.watched.len(),
                state.listeners.len()
            );
        }
        Ok(())
    }

    /// Watch one more room. Skipped when an active listener, or the
    /// `watch` still setting up, already covers it. Returns whether a
    /// listener was added.
    pub async fn watch_single(&self, room_id: &RoomId) -> Result<bool, SyncError> {
        let generation = {
            let state = self.state.lock().await;
            if state.covers(room_id) {
                debug!("Room {} already covered by a listener", room_id);
                return Ok(false);
            }
            state.generation
        };

        let signature = chunk_signature(std::slice::from_ref(room_id));
        let query = Query::collection(paths::ROOMS).where_in(DOCUMENT_ID, [room_id.to_string()]);
        let listener = self
            .store
            .listen(&query)
            .await
            .map_err(|source| SyncError::ListenerSetup {
                signature: signature.clone(),
                source,
            })?;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            listener.handle.remove();
            return Err(SyncError::Superseded);
        }
        if state.covers(room_id) {
            listener.handle.remove();
            return Ok(false);
        }
        let pump = tokio::spawn(pump(listener.changes, self.feed.clone()));
        state.watched.insert(room_id.clone());
        state.listeners.insert(
            signature,
            ActiveListener {
                rooms: vec![room_id.clone()],
                handle: listener.handle,
                pump,
            },
        );
        debug!("Watching room {} with a single listener", room_id);
        Ok(true)
    }

    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        let count = state.listeners.len();
        state.teardown();
        if count > 0 {
            info!("Stopped {} room listeners", count);
        }
    }

    pub async fn watched(&self) -> BTreeSet<RoomId> {
        self.state.lock().await.watched.clone()
    }

    /// Signature and listener identity of every active listener.
    pub async fn listeners(&self) -> Vec<(String, ListenerId)> {
        self.state
            .lock()
            .await
            .listeners
            .iter()
            .map(|(signature, l)| (signature.clone(), l.handle.id()))
            .collect()
    }

    /// Rooms covered by each active listener.
    pub async fn coverage(&self) -> Vec<Vec<RoomId>> {
        self.state
            .lock()
            .await
            .listeners
            .values()
            .map(|l| l.rooms.clone())
            .collect()
    }
}

async fn pump(mut changes: mpsc::UnboundedReceiver<Vec<DocumentChange>>, feed: broadcast::Sender<Room>) {
    while let Some(batch) = changes.recv().await {
        for change in batch {
            if change.kind == ChangeKind::Removed {
                continue;
            }
            if let Some(room) = decode_one::<Room>(&change.document, "room") {
                let _ = feed.send(room);
            }
        }
    }
}
