use tether_gateway::GatewayError;
use tether_store::StoreError;
use tether_types::{RoomId, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Opening the listener for one chunk of a watch failed. Rooms in
    /// earlier chunks stay watched.
    #[error("listener setup failed for [{signature}]: {source}")]
    ListenerSetup {
        signature: String,
        #[source]
        source: StoreError,
    },

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("{user} is the last participant of room {room}")]
    LastParticipant { user: UserId, room: RoomId },

    /// A newer join or leave for the same user replaced this one.
    #[error("superseded by a newer membership change")]
    Superseded,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
