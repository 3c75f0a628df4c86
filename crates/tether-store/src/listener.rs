use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::document::DocumentSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: DocumentSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Token bound to a live server-side subscription.
///
/// Owners call [`ListenerHandle::remove`]. A handle dropped without that
/// call still releases the subscription.
pub struct ListenerHandle {
    id: ListenerId,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub fn new(id: ListenerId, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn remove(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            debug!("{} dropped without explicit removal", self.id);
            release();
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("live", &self.release.is_some())
            .finish()
    }
}

/// A live subscription: its handle plus the batches of changes it yields.
pub struct Listener {
    pub handle: ListenerHandle,
    pub changes: mpsc::UnboundedReceiver<Vec<DocumentChange>>,
}
