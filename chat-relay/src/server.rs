use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader, Lines},
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc, watch},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::HubConfig,
    error::{HubError, InvalidReason},
    hub::{BroadcastHub, BroadcastReport},
    message::{ClientToServer, Message, ServerToClient, next_frame, next_message, write_message},
    registry::{ConnectionId, ConnectionRegistry},
};

const SHUTDOWN_NOTICE: &str = "hub shutting down";

pub struct Server {
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    config: HubConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        let registry = ConnectionRegistry::with_capacity_limit(config.max_connections);
        let hub = BroadcastHub::new(registry, config.self_delivery);
        Self::with_hub(listener, Arc::new(hub), config)
    }

    /// Builds a server around an existing hub, e.g. one shared with tests.
    pub fn with_hub(listener: TcpListener, hub: Arc<BroadcastHub>, config: HubConfig) -> Self {
        Self {
            listener,
            hub,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            hub,
            config,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = Arc::new(config);
        tokio::pin!(shutdown);
        debug!(capacity = ?hub.registry().capacity(), "accepting connections");

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("hub shutting down");
                    let _ = stop_tx.send(true);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &hub, &config, &stop_rx);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    hub: &Arc<BroadcastHub>,
    config: &Arc<HubConfig>,
    stop: &watch::Receiver<bool>,
) {
    match result {
        Ok((stream, peer)) => {
            let hub = Arc::clone(hub);
            let config = Arc::clone(config);
            let stop = stop.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, hub, config, stop).await {
                    warn!(peer = %peer, error = ?err, "connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn handle_connection(
    stream: TcpStream,
    hub: Arc<BroadcastHub>,
    config: Arc<HubConfig>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let requested = timeout(config.handshake_timeout, perform_handshake(&mut lines, &mut writer))
        .await
        .context("handshake timed out")??;

    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
    let (id, identity) = match hub.connect(requested, outbound_tx).await {
        Ok(admitted) => admitted,
        Err(err) => {
            reject(&mut writer, &err, config.write_timeout).await?;
            return Err(err).context("connection refused");
        }
    };

    info!(?peer, connection = %id, %identity, "client joined");
    let welcome = ServerToClient::Welcome {
        connection_id: id,
        identity: identity.clone(),
    };
    let result = match send_frame(&mut writer, &welcome, config.write_timeout).await {
        Ok(()) => {
            let session = Session {
                hub: hub.as_ref(),
                id,
                write_timeout: config.write_timeout,
            };
            session.run(&mut lines, &mut writer, outbound_rx, stop).await
        }
        Err(err) => Err(err.into()),
    };

    hub.disconnect(id).await;
    info!(?peer, connection = %id, %identity, "client disconnected");
    result
}

async fn perform_handshake<R, W>(lines: &mut Lines<R>, writer: &mut W) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match next_message::<_, ClientToServer>(lines).await? {
        Some(ClientToServer::Hello { identity }) => Ok(identity),
        Some(ClientToServer::Send { .. }) => {
            write_message(
                writer,
                &ServerToClient::Error {
                    message: "expected hello before sending messages".to_string(),
                },
            )
            .await?;
            anyhow::bail!("expected hello message first")
        }
        None => anyhow::bail!("connection closed before handshake"),
    }
}

async fn reject<W>(writer: &mut W, error: &HubError, limit: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let refusal = ServerToClient::Error {
        message: error.to_string(),
    };
    send_frame(writer, &refusal, limit).await?;
    Ok(())
}

/// Per-connection state threaded through the session loop.
struct Session<'a> {
    hub: &'a BroadcastHub,
    id: ConnectionId,
    write_timeout: Duration,
}

impl Session<'_> {
    async fn run<R, W>(
        &self,
        lines: &mut Lines<R>,
        writer: &mut W,
        mut outbound: mpsc::Receiver<Message>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if *stop.borrow() {
            return Ok(());
        }

        loop {
            select! {
                inbound = next_frame::<_, ClientToServer>(lines) => {
                    if !self.handle_client_message(inbound?, writer).await? {
                        break;
                    }
                }
                delivery = outbound.recv() => {
                    let Some(message) = delivery else { break };
                    let frame = ServerToClient::from(message);
                    if let Err(err) = send_frame(writer, &frame, self.write_timeout).await {
                        debug!(connection = %self.id, ?err, "failed to deliver message to client");
                        break;
                    }
                }
                _ = stop.changed() => {
                    let notice = ServerToClient::Error {
                        message: SHUTDOWN_NOTICE.to_string(),
                    };
                    let _ = send_frame(writer, &notice, self.write_timeout).await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Answers one inbound line. Returns `false` once the client has hung up.
    async fn handle_client_message<W>(
        &self,
        inbound: Option<Result<ClientToServer, serde_json::Error>>,
        writer: &mut W,
    ) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let reply = match inbound {
            Some(Ok(ClientToServer::Send { body })) => ack(self.hub.broadcast(self.id, body).await),
            Some(Ok(ClientToServer::Hello { .. })) => ServerToClient::Error {
                message: "already connected".to_string(),
            },
            Some(Err(err)) => {
                debug!(connection = %self.id, %err, "refusing undecodable frame");
                ack(Err(HubError::InvalidMessage(InvalidReason::Malformed)))
            }
            None => return Ok(false),
        };

        send_frame(writer, &reply, self.write_timeout).await?;
        Ok(true)
    }
}

async fn send_frame<W>(writer: &mut W, frame: &ServerToClient, limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(limit, write_message(writer, frame))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "client stopped reading"))?
}

fn ack(result: Result<BroadcastReport, HubError>) -> ServerToClient {
    match result {
        Ok(report) => ServerToClient::Ack {
            success: true,
            details: format!("relayed to {} of {} connections", report.delivered, report.attempted),
        },
        Err(err) => ServerToClient::Ack {
            success: false,
            details: err.to_string(),
        },
    }
}
