use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The connection went away while a request was outstanding.
    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}
