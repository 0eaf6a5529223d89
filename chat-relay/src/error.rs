use thiserror::Error;

use crate::registry::ConnectionId;

/// Failures raised by the registry and the broadcast hub.
///
/// Every variant is scoped to a single sender or a single recipient; none of
/// them stop the hub from serving other connections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("{0}")]
    InvalidMessage(InvalidReason),
    #[error("connection {0} is not registered")]
    ConnectionNotFound(ConnectionId),
    #[error("delivery to connection {id} failed: {reason}")]
    DeliveryFailed {
        id: ConnectionId,
        reason: DeliveryFailure,
    },
    #[error("connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },
}

/// Why a `send` from a client was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidReason {
    #[error("message body cannot be empty")]
    Empty,
    #[error("message frame could not be decoded")]
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// Failures seen by a client connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unexpected frame from hub: {0}")]
    Protocol(String),
    #[error("hub refused the connection: {0}")]
    Rejected(String),
    #[error("not connected to a hub")]
    NotConnected,
    #[error("timed out waiting for acknowledgement")]
    AckTimeout,
    #[error("connection closed")]
    Closed,
}
