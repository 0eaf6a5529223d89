use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

use crate::registry::ConnectionId;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One chat line as relayed by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToServer {
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
    },
    Send {
        body: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToClient {
    Welcome {
        connection_id: ConnectionId,
        identity: String,
    },
    Ack {
        success: bool,
        details: String,
    },
    Message {
        sender: String,
        body: String,
    },
    Error {
        message: String,
    },
}

impl From<Message> for ServerToClient {
    fn from(message: Message) -> Self {
        ServerToClient::Message {
            sender: message.sender,
            body: message.body,
        }
    }
}

/// Reads the next frame from a line stream, skipping blank lines.
///
/// `Lines::next_line` is cancel safe, which lets session loops race it against
/// other events in `select!` without losing partial frames.
pub async fn next_message<R, T>(lines: &mut Lines<R>) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    while let Some(line) = lines.next_line().await? {
        if let Some(message) = decode_line(&line)? {
            return Ok(Some(message));
        }
    }
    Ok(None)
}

/// Like [`next_message`], but a line that is not a valid frame comes back as
/// `Some(Err(_))` so the caller can refuse it and keep reading. Lines that are
/// not UTF-8 still surface as an I/O error.
pub async fn next_frame<R, T>(
    lines: &mut Lines<R>,
) -> io::Result<Option<Result<T, serde_json::Error>>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    while let Some(line) = lines.next_line().await? {
        if let Some(frame) = parse_line(&line) {
            return Ok(Some(frame));
        }
    }
    Ok(None)
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        if let Some(message) = decode_line(&line)? {
            return Ok(Some(message));
        }
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn decode_line<T: DeserializeOwned>(line: &str) -> io::Result<Option<T>> {
    parse_line(line).transpose().map_err(to_io_error)
}

fn parse_line<T: DeserializeOwned>(line: &str) -> Option<Result<T, serde_json::Error>> {
    let trimmed = line.trim_end_matches(LINE_ENDINGS);
    if trimmed.trim().is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed))
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
