use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    client::MessageHandler,
    error::ClientError,
    message::{ClientToServer, ServerToClient, next_message, write_message},
    registry::ConnectionId,
};

type PendingAcks = Arc<Mutex<VecDeque<oneshot::Sender<Ack>>>>;

/// The hub's receipt for one `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
    pub details: String,
}

/// A single established link to a hub.
///
/// Incoming chat lines are dispatched to the handler from a background reader
/// task. Acks arrive in the order sends were written, so they are matched to
/// callers through a FIFO queue.
pub struct Connection {
    connection_id: ConnectionId,
    identity: String,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingAcks,
    closed: watch::Receiver<bool>,
    reader: JoinHandle<()>,
    ack_timeout: Duration,
}

impl Connection {
    pub async fn connect(
        addr: SocketAddr,
        identity: Option<String>,
        ack_timeout: Duration,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        write_message(&mut writer, &ClientToServer::Hello { identity }).await?;
        // The welcome frame is the hub's acknowledgement of the hello.
        let welcome = timeout(ack_timeout, next_message(&mut lines))
            .await
            .map_err(|_| ClientError::AckTimeout)??;
        let (connection_id, identity) = match welcome {
            Some(ServerToClient::Welcome {
                connection_id,
                identity,
            }) => (connection_id, identity),
            Some(ServerToClient::Error { message }) => return Err(ClientError::Rejected(message)),
            Some(other) => return Err(ClientError::Protocol(format!("{other:?}"))),
            None => return Err(ClientError::Closed),
        };

        let pending = PendingAcks::default();
        let (closed_tx, closed) = watch::channel(false);
        let reader = tokio::spawn(read_frames(
            lines,
            handler,
            Arc::clone(&pending),
            closed_tx,
        ));

        Ok(Self {
            connection_id,
            identity,
            writer: Mutex::new(writer),
            pending,
            closed,
            reader,
            ack_timeout,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Sends a chat line and waits for the hub to acknowledge receipt.
    ///
    /// A send abandoned mid-write leaves no waiter behind, so later acks still
    /// reach their own callers.
    pub async fn send(&self, body: impl Into<String>) -> Result<Ack, ClientError> {
        let frame = ClientToServer::Send { body: body.into() };
        let ack_rx = {
            let mut writer = self.writer.lock().await;
            // The reader resolves acks under this lock, so queueing the waiter
            // after the write cannot miss an early ack.
            let mut pending = self.pending.lock().await;
            if *self.closed.borrow() {
                return Err(ClientError::Closed);
            }
            write_message(&mut *writer, &frame).await?;

            let (ack_tx, ack_rx) = oneshot::channel();
            pending.push_back(ack_tx);
            ack_rx
        };

        match timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::AckTimeout),
        }
    }

    /// Resolves once the hub side of the connection is gone.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub async fn close(&self) {
        if let Err(error) = self.writer.lock().await.shutdown().await {
            debug!(?error, "failed to shut down connection cleanly");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_frames(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    handler: Arc<dyn MessageHandler>,
    pending: PendingAcks,
    closed: watch::Sender<bool>,
) {
    loop {
        let frame = match next_message::<_, ServerToClient>(&mut lines).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(error) => {
                warn!(?error, "dropping connection after unreadable frame");
                break;
            }
        };

        match frame {
            ServerToClient::Message { sender, body } => handler.on_message(&sender, &body),
            ServerToClient::Ack { success, details } => {
                let waiter = pending.lock().await.pop_front();
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ack { success, details });
                    }
                    None => debug!(%details, "ack without a pending send"),
                }
            }
            ServerToClient::Error { message } => handler.on_notice(&message),
            ServerToClient::Welcome { .. } => debug!("ignoring repeated welcome"),
        }
    }

    // Dropping the waiters fails any send still waiting for its ack.
    let mut pending = pending.lock().await;
    pending.clear();
    let _ = closed.send(true);
}
