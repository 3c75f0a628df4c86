//! The chat sync core: ranked room list, live room documents, paged message
//! history, membership bookkeeping, and the [`ChatSession`] that wires them
//! to a realtime transport and a local cache.

pub mod backoff;
pub mod change_stream;
pub mod decode;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod messages;
pub mod paths;
pub mod session;

pub use backoff::Backoff;
pub use change_stream::{RoomChangeStream, chunk_signature};
pub use directory::{RoomDirectory, RoomEdit, RoomEntry, RoomPage};
pub use error::SyncError;
pub use ledger::{NewRoom, ParticipantLedger};
pub use messages::{DeletionWatch, MessageSyncEngine};
pub use session::{ChatSession, RoomView, SessionConfig};
