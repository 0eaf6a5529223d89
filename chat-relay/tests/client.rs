use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use chat_relay::{
    client::{Backoff, Connection, ConnectionState, ReconnectingClient},
    config::{ClientConfig, HubConfig},
    error::ClientError,
    message::{ClientToServer, ServerToClient, next_frame, write_message},
    registry::ConnectionId,
    server::Server,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(3);

struct RunningHub {
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl RunningHub {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.server.await;
    }
}

fn serve(listener: TcpListener) -> RunningHub {
    let server = Server::new(listener, HubConfig::default());
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });
    RunningHub { shutdown, server }
}

fn config(addr: SocketAddr, identity: &str) -> ClientConfig {
    ClientConfig {
        identity: Some(identity.into()),
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(100)),
        ..ClientConfig::new(addr)
    }
}

fn collecting_client(config: ClientConfig) -> (ReconnectingClient, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |sender: &str, body: &str| {
        let _ = tx.send(format!("{sender}: {body}"));
    };
    (ReconnectingClient::spawn(config, Arc::new(handler)), rx)
}

async fn wait_for_state(
    states: &mut watch::Receiver<ConnectionState>,
    predicate: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    timeout(WAIT, states.wait_for(predicate))
        .await
        .expect("timed out waiting for client state")
        .expect("client supervisor stopped")
        .clone()
}

#[tokio::test]
async fn clients_exchange_messages_through_hub() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hub = serve(listener);

    let (alice, mut alice_inbox) = collecting_client(config(addr, "alice"));
    let (bob, mut bob_inbox) = collecting_client(config(addr, "bob"));
    wait_for_state(&mut alice.subscribe(), ConnectionState::is_connected).await;
    wait_for_state(&mut bob.subscribe(), ConnectionState::is_connected).await;

    let ack = alice.send("hi").await?;
    assert!(ack.success, "{}", ack.details);

    assert_eq!(timeout(WAIT, bob_inbox.recv()).await?.as_deref(), Some("alice: hi"));
    assert_eq!(timeout(WAIT, alice_inbox.recv()).await?.as_deref(), Some("alice: hi"));

    alice.shutdown().await;
    bob.shutdown().await;
    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn blank_send_is_negatively_acknowledged() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hub = serve(listener);

    let (alice, _inbox) = collecting_client(config(addr, "alice"));
    wait_for_state(&mut alice.subscribe(), ConnectionState::is_connected).await;

    let ack = alice.send("  ").await?;
    assert!(!ack.success);
    assert_eq!(ack.details, "message body cannot be empty");

    alice.shutdown().await;
    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn client_reconnects_after_hub_restart() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hub = serve(listener);

    let (alice, mut inbox) = collecting_client(config(addr, "alice"));
    let mut states = alice.subscribe();
    wait_for_state(&mut states, ConnectionState::is_connected).await;

    hub.stop().await;
    wait_for_state(&mut states, |state| {
        matches!(state, ConnectionState::Backoff { .. })
    })
    .await;
    assert!(matches!(
        alice.send("lost").await,
        Err(ClientError::NotConnected)
    ));

    let hub = serve(TcpListener::bind(addr).await?);
    let state = wait_for_state(&mut states, ConnectionState::is_connected).await;
    let ConnectionState::Connected { identity, .. } = state else {
        unreachable!("waited for a connected state");
    };
    assert_eq!(identity, "alice");

    let ack = alice.send("back again").await?;
    assert!(ack.success);
    assert_eq!(timeout(WAIT, inbox.recv()).await?.as_deref(), Some("alice: back again"));

    alice.shutdown().await;
    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_pending_backoff() -> Result<()> {
    // Reserve a port, then free it so nothing is listening there.
    let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let config = ClientConfig {
        backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(30)).without_jitter(),
        ..ClientConfig::new(addr)
    };
    let (client, _inbox) = collecting_client(config);

    let state = wait_for_state(&mut client.subscribe(), |state| {
        matches!(state, ConnectionState::Backoff { .. })
    })
    .await;
    assert_eq!(
        state,
        ConnectionState::Backoff {
            attempt: 1,
            delay: Duration::from_secs(30)
        }
    );

    let mut states = client.subscribe();
    timeout(Duration::from_secs(1), client.shutdown())
        .await
        .expect("shutdown should not wait out the backoff");
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
    Ok(())
}

/// A stand-in hub that echoes each send body back as the ack details and
/// answers undecodable lines with a negative ack. It stops reading after the
/// handshake until `start_reading` fires.
async fn echo_ack_hub(listener: TcpListener, start_reading: oneshot::Receiver<()>) -> Result<()> {
    let (stream, _) = listener.accept().await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let _hello = lines.next_line().await?;
    let welcome = ServerToClient::Welcome {
        connection_id: ConnectionId::from(1),
        identity: "alice".into(),
    };
    write_message(&mut writer, &welcome).await?;

    let _ = start_reading.await;
    while let Some(frame) = next_frame::<_, ClientToServer>(&mut lines).await? {
        let reply = match frame {
            Ok(ClientToServer::Send { body }) => ServerToClient::Ack {
                success: true,
                details: body,
            },
            _ => ServerToClient::Ack {
                success: false,
                details: "garbled".into(),
            },
        };
        write_message(&mut writer, &reply).await?;
    }
    Ok(())
}

#[tokio::test]
async fn abandoned_send_does_not_shift_later_acks() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (start_reading, start_rx) = oneshot::channel();
    let hub = tokio::spawn(echo_ack_hub(listener, start_rx));

    let connection = Connection::connect(
        addr,
        Some("alice".into()),
        WAIT,
        Arc::new(|_: &str, _: &str| {}),
    )
    .await?;

    // Far larger than the socket buffers, so the write is cut off part way.
    let oversized = "x".repeat(32 * 1024 * 1024);
    let abandoned = timeout(Duration::from_millis(100), connection.send(oversized)).await;
    assert!(abandoned.is_err(), "oversized send should still be writing");
    let _ = start_reading.send(());

    // The truncated frame swallows the next one; that send owns the reply.
    let garbled = connection.send("second").await?;
    assert!(!garbled.success);
    assert_eq!(garbled.details, "garbled");

    let ack = connection.send("third").await?;
    assert!(ack.success);
    assert_eq!(ack.details, "third");

    connection.close().await;
    drop(connection);
    let _ = timeout(WAIT, hub).await;
    Ok(())
}

#[tokio::test]
async fn send_after_hub_closes_fails_fast() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hub = serve(listener);

    let connection = Connection::connect(
        addr,
        Some("alice".into()),
        Duration::from_secs(10),
        Arc::new(|_: &str, _: &str| {}),
    )
    .await?;
    hub.stop().await;
    timeout(WAIT, connection.closed())
        .await
        .expect("connection should observe the hub going away");

    let result = timeout(Duration::from_secs(1), connection.send("late"))
        .await
        .expect("send should not wait for an ack that cannot arrive");
    assert!(matches!(result, Err(ClientError::Closed)));
    Ok(())
}
