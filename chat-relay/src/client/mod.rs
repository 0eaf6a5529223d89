//! Client side of the relay: a single hub connection, the reconnect state
//! machine, and a supervisor that drives one through the other.

mod backoff;
mod connection;
mod state;
mod supervisor;

pub use backoff::Backoff;
pub use connection::{Ack, Connection};
pub use state::{ConnectionState, Event};
pub use supervisor::ReconnectingClient;

/// Consumer of chat lines pushed by the hub.
///
/// Called from the connection's reader task, so implementations should hand
/// work off rather than block.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, sender: &str, body: &str);

    /// Out-of-band notices from the hub, such as a shutdown warning.
    fn on_notice(&self, _message: &str) {}
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    fn on_message(&self, sender: &str, body: &str) {
        self(sender, body)
    }
}
