use std::time::Duration;

use crate::{client::Backoff, registry::ConnectionId};

/// Lifecycle of a reconnecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// `attempt` counts consecutive failures so far.
    Connecting { attempt: u32 },
    Connected {
        connection_id: ConnectionId,
        identity: String,
    },
    Backoff { attempt: u32, delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    Connected {
        connection_id: ConnectionId,
        identity: String,
    },
    ConnectFailed,
    ConnectionLost,
    BackoffElapsed,
    Stop,
}

impl ConnectionState {
    /// Applies `event`, returning the next state. Events that make no sense in
    /// the current state leave it unchanged.
    pub fn on(self, event: Event, backoff: &Backoff) -> ConnectionState {
        use ConnectionState as S;

        match (self, event) {
            (_, Event::Stop) => S::Disconnected,
            (S::Disconnected, Event::Start) => S::Connecting { attempt: 0 },
            (
                S::Connecting { .. },
                Event::Connected {
                    connection_id,
                    identity,
                },
            ) => S::Connected {
                connection_id,
                identity,
            },
            (S::Connecting { attempt }, Event::ConnectFailed) => {
                let attempt = attempt.saturating_add(1);
                S::Backoff {
                    attempt,
                    delay: backoff.delay(attempt),
                }
            }
            (S::Connected { .. }, Event::ConnectionLost) => S::Connecting { attempt: 0 },
            (S::Backoff { attempt, .. }, Event::BackoffElapsed) => S::Connecting { attempt },
            (state, _) => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}
