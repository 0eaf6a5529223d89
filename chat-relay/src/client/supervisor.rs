use std::sync::Arc;

use tokio::{
    select,
    sync::{Mutex, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{info, warn};

use crate::{
    client::{Ack, Connection, ConnectionState, Event, MessageHandler},
    config::ClientConfig,
    error::ClientError,
};

type ActiveConnection = Arc<Mutex<Option<Arc<Connection>>>>;

/// Keeps a client connected to a hub, reconnecting with backoff whenever the
/// link drops, until [`ReconnectingClient::shutdown`] is called.
pub struct ReconnectingClient {
    state: watch::Receiver<ConnectionState>,
    active: ActiveConnection,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconnectingClient {
    pub fn spawn(config: ClientConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (stop, stop_rx) = watch::channel(false);
        let active = ActiveConnection::default();

        let task = tokio::spawn(supervise(
            config,
            handler,
            state_tx,
            Arc::clone(&active),
            stop_rx,
        ));

        Self {
            state,
            active,
            stop,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Sends through the current connection. Fails fast while reconnecting.
    pub async fn send(&self, body: impl Into<String>) -> Result<Ack, ClientError> {
        let connection = self
            .active
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        connection.send(body).await
    }

    /// Stops reconnecting, closes the current connection and waits for the
    /// supervisor to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(error) = self.task.await {
            warn!(?error, "client supervisor ended abnormally");
        }
    }
}

async fn supervise(
    config: ClientConfig,
    handler: Arc<dyn MessageHandler>,
    state_tx: watch::Sender<ConnectionState>,
    active: ActiveConnection,
    mut stop: watch::Receiver<bool>,
) {
    let mut state = ConnectionState::Disconnected.on(Event::Start, &config.backoff);
    let mut connection: Option<Arc<Connection>> = None;

    loop {
        state_tx.send_replace(state.clone());

        let event = match &state {
            ConnectionState::Disconnected => break,
            ConnectionState::Connecting { attempt } => {
                let connect = Connection::connect(
                    config.server,
                    config.identity.clone(),
                    config.ack_timeout,
                    Arc::clone(&handler),
                );
                select! {
                    result = connect => match result {
                        Ok(established) => {
                            let established = Arc::new(established);
                            info!(
                                server = %config.server,
                                connection = %established.connection_id(),
                                identity = established.identity(),
                                "connected to hub"
                            );
                            *active.lock().await = Some(Arc::clone(&established));
                            let event = Event::Connected {
                                connection_id: established.connection_id(),
                                identity: established.identity().to_string(),
                            };
                            connection = Some(established);
                            event
                        }
                        Err(error) => {
                            warn!(server = %config.server, attempt, %error, "failed to connect to hub");
                            Event::ConnectFailed
                        }
                    },
                    _ = stopped(&mut stop) => Event::Stop,
                }
            }
            ConnectionState::Connected { .. } => {
                let event = match &connection {
                    Some(current) => select! {
                        _ = current.closed() => Event::ConnectionLost,
                        _ = stopped(&mut stop) => Event::Stop,
                    },
                    None => Event::ConnectionLost,
                };
                if event == Event::ConnectionLost {
                    info!(server = %config.server, "lost connection to hub");
                }
                release(&active, &mut connection).await;
                event
            }
            ConnectionState::Backoff { delay, .. } => {
                select! {
                    _ = sleep(*delay) => Event::BackoffElapsed,
                    _ = stopped(&mut stop) => Event::Stop,
                }
            }
        };

        state = state.on(event, &config.backoff);
    }

    release(&active, &mut connection).await;
    state_tx.send_replace(ConnectionState::Disconnected);
}

async fn release(active: &ActiveConnection, connection: &mut Option<Arc<Connection>>) {
    active.lock().await.take();
    if let Some(connection) = connection.take() {
        connection.close().await;
    }
}

/// Resolves when a stop was requested or the client handle was dropped.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
