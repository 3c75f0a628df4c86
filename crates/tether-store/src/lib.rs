//! Remote document store collaborator.
//!
//! The sync core only talks to the remote store through [`RemoteStore`].
//! Documents live in collections addressed by slash-separated paths
//! (`rooms`, `rooms/{id}/messages`), hold a JSON object body, and are read
//! through ordered, cursor-paginated [`Query`]s or live [`Listener`]s.

pub mod document;
pub mod error;
pub mod listener;
pub mod memory;
pub mod query;
pub mod write;

use async_trait::async_trait;
use serde_json::Value;

pub use document::{Cursor, DocumentPath, DocumentSnapshot};
pub use error::StoreError;
pub use listener::{ChangeKind, DocumentChange, Listener, ListenerHandle, ListenerId};
pub use memory::MemoryStore;
pub use query::{DOCUMENT_ID, Direction, Filter, MAX_IN_VALUES, OrderBy, Query};
pub use write::{FieldValue, Precondition, WriteBatch, WriteOp};

#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Read one document. May be served from a client-side cache.
    async fn get(&self, path: &DocumentPath) -> Result<Option<DocumentSnapshot>, StoreError>;

    /// Read one document from the authoritative source, never a cache.
    async fn get_fresh(&self, path: &DocumentPath) -> Result<Option<DocumentSnapshot>, StoreError> {
        self.get(path).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<DocumentSnapshot>, StoreError>;

    /// Allocate a path with a store-assigned id in `collection`. Nothing is
    /// written until a batch referencing it commits.
    fn new_document_path(&self, collection: &str) -> DocumentPath;

    /// Apply every write in `batch` atomically, after checking its
    /// preconditions. Either all writes become visible or none do.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Open a live subscription. The current matching documents arrive first
    /// as `Added` changes, followed by deltas as they happen.
    async fn listen(&self, query: &Query) -> Result<Listener, StoreError>;

    async fn set(&self, path: &DocumentPath, data: Value) -> Result<(), StoreError> {
        self.commit(WriteBatch::new().set(path.clone(), data)).await
    }

    async fn update(
        &self,
        path: &DocumentPath,
        fields: Vec<(String, FieldValue)>,
    ) -> Result<(), StoreError> {
        self.commit(WriteBatch::new().update(path.clone(), fields)).await
    }

    async fn delete(&self, path: &DocumentPath) -> Result<(), StoreError> {
        self.commit(WriteBatch::new().delete(path.clone())).await
    }
}
