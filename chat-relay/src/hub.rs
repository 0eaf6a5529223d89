use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::{
    error::{DeliveryFailure, HubError, InvalidReason},
    message::Message,
    registry::{Connection, ConnectionId, ConnectionRegistry},
};

/// Identity used when the sender disconnected before its message was relayed.
pub const UNKNOWN_SENDER: &str = "unknown";

const GUEST_PREFIX: &str = "guest-";
const GUEST_SUFFIX_LEN: usize = 6;
const GUEST_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Whether a sender receives its own messages back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelfDelivery {
    #[default]
    Include,
    Exclude,
}

/// Outcome of one fan-out attempt. Counts queue pushes, not confirmed reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
}

/// Relays chat messages to every registered connection.
pub struct BroadcastHub {
    registry: ConnectionRegistry,
    self_delivery: SelfDelivery,
}

impl BroadcastHub {
    pub fn new(registry: ConnectionRegistry, self_delivery: SelfDelivery) -> Self {
        Self {
            registry,
            self_delivery,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Registers a new connection, generating a guest identity when the client
    /// did not pick one.
    pub async fn connect(
        &self,
        identity: Option<String>,
        outbound: mpsc::Sender<Message>,
    ) -> Result<(ConnectionId, String), HubError> {
        let identity = resolve_identity(identity);
        let id = self.registry.register(identity.clone(), outbound).await?;
        debug!(connection = %id, %identity, "connection registered");
        Ok((id, identity))
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        if let Some(connection) = self.registry.unregister(id).await {
            debug!(connection = %id, identity = connection.identity(), "connection unregistered");
        }
    }

    pub async fn broadcast(
        &self,
        sender_id: ConnectionId,
        body: String,
    ) -> Result<BroadcastReport, HubError> {
        if body.trim().is_empty() {
            return Err(HubError::InvalidMessage(InvalidReason::Empty));
        }

        let sender = match self.registry.identity_of(sender_id).await {
            Ok(identity) => identity,
            Err(error) => {
                debug!(%error, "relaying message from departed sender");
                UNKNOWN_SENDER.to_string()
            }
        };

        // The registry lock is released here; fan-out runs against the copy.
        let recipients = self.registry.snapshot().await;
        let message = Message { sender, body };
        let mut report = BroadcastReport::default();

        for connection in recipients {
            if self.self_delivery == SelfDelivery::Exclude && connection.id() == sender_id {
                continue;
            }

            report.attempted += 1;
            match push(&connection, message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    debug!(%error, "dropping message for recipient");
                    report.dropped += 1;
                }
            }
        }

        Ok(report)
    }
}

fn push(connection: &Connection, message: Message) -> Result<(), HubError> {
    let id = connection.id();
    if !connection.is_alive() {
        return Err(HubError::DeliveryFailed {
            id,
            reason: DeliveryFailure::Closed,
        });
    }

    connection
        .outbound()
        .try_send(message)
        .map_err(|error| HubError::DeliveryFailed {
            id,
            reason: match error {
                TrySendError::Full(_) => DeliveryFailure::QueueFull,
                TrySendError::Closed(_) => DeliveryFailure::Closed,
            },
        })
}

fn resolve_identity(requested: Option<String>) -> String {
    match requested {
        Some(identity) if !identity.trim().is_empty() => identity.trim().to_string(),
        _ => format!(
            "{GUEST_PREFIX}{}",
            nanoid::nanoid!(GUEST_SUFFIX_LEN, &GUEST_ALPHABET)
        ),
    }
}
