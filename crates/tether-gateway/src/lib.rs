//! Realtime side of the sync core: a pluggable bidirectional
//! [`Connection`] and the [`RealtimeTransport`] that manages room
//! membership, per-room fan-out and acknowledged sends on top of it.

pub mod connection;
pub mod error;
pub mod loopback;
pub mod transport;
pub mod ws;

pub use connection::{Connection, EventListener, EventRegistry, SubscriptionId};
pub use error::GatewayError;
pub use loopback::{AckScript, EmittedFrame, LoopbackConnection};
pub use transport::{
    ActivityRecorder, ConnectionState, RealtimeTransport, RoomStream, SendOutcome, TransportConfig,
};
pub use ws::WsConnection;
