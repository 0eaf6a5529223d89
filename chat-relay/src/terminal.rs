use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    cli::{ClientArgs, PingArgs},
    client::{ConnectionState, MessageHandler, ReconnectingClient},
    config::ClientConfig,
};

enum Incoming {
    Message { sender: String, body: String },
    Notice(String),
}

/// Forwards hub traffic to the terminal loop so all output is written from
/// one place.
struct Forwarder {
    tx: mpsc::UnboundedSender<Incoming>,
}

impl MessageHandler for Forwarder {
    fn on_message(&self, sender: &str, body: &str) {
        let _ = self.tx.send(Incoming::Message {
            sender: sender.to_string(),
            body: body.to_string(),
        });
    }

    fn on_notice(&self, message: &str) {
        let _ = self.tx.send(Incoming::Notice(message.to_string()));
    }
}

/// Interactive chat: stdin lines are sent, hub messages are printed.
pub async fn run(args: ClientArgs) -> Result<()> {
    let (tx, mut incoming) = mpsc::unbounded_channel();
    let client = ReconnectingClient::spawn(ClientConfig::from(&args), Arc::new(Forwarder { tx }));
    let mut states = client.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        select! {
            Some(message) = incoming.recv() => render_incoming(message).await?,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                render_state(&state).await?;
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line?, &client).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn handle_stdin_input(line: Option<String>, client: &ReconnectingClient) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    match client.send(text).await {
        Ok(ack) if ack.success => debug!(details = %ack.details, "message acknowledged"),
        Ok(ack) => write_stderr(&format!("!!! {}", ack.details)).await?,
        Err(error) => write_stderr(&format!("!!! {error}")).await?,
    }
    Ok(true)
}

async fn render_incoming(message: Incoming) -> io::Result<()> {
    match message {
        Incoming::Message { sender, body } => write_stdout(&format!("<{sender}> {body}")).await,
        Incoming::Notice(message) => write_stderr(&format!("!!! {message}")).await,
    }
}

async fn render_state(state: &ConnectionState) -> io::Result<()> {
    match state {
        ConnectionState::Connected { identity, .. } => {
            write_stdout(&format!("*** connected as {identity}")).await
        }
        ConnectionState::Backoff { delay, .. } => {
            write_stdout(&format!(
                "*** hub unreachable, retrying in {} ms",
                delay.as_millis()
            ))
            .await
        }
        ConnectionState::Disconnected | ConnectionState::Connecting { .. } => Ok(()),
    }
}

/// Scripted sender: posts `args.body` every `args.interval_ms` and logs
/// whatever the hub relays back.
pub async fn ping(args: PingArgs) -> Result<()> {
    let handler = |sender: &str, body: &str| info!("{sender}: {body}");
    let client = ReconnectingClient::spawn(ClientConfig::from(&args), Arc::new(handler));

    let mut ticker = interval(Duration::from_millis(args.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent = 0u64;

    loop {
        select! {
            _ = ticker.tick() => {
                if args.count.is_some_and(|count| sent >= count) {
                    break;
                }
                match client.send(args.body.as_str()).await {
                    Ok(ack) => {
                        sent += 1;
                        debug!(success = ack.success, details = %ack.details, "ping acknowledged");
                    }
                    Err(error) => warn!(%error, "ping not sent"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
