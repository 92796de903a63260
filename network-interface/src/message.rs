use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::pool::ByteCount;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A command as it travels to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireRequest {
    pub id: u64,
    pub op: i32,
    pub db: String,
    pub cmd: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireReply {
    Reply { id: u64, data: Value },
    Error { id: u64, message: String },
}

impl WireReply {
    pub fn id(&self) -> u64 {
        match self {
            Self::Reply { id, .. } | Self::Error { id, .. } => *id,
        }
    }
}

/// Reads the next message, skipping blank lines. `None` means the peer closed
/// the stream.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<(T, ByteCount)>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // Newline-delimited JSON keeps the protocol usable from netcat-style tools.
    let mut line = String::new();
    let mut physical = 0u64;
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        physical += bytes as u64;

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        let count = ByteCount {
            logical: trimmed.len() as u64,
            physical,
        };
        return Ok(Some((parsed, count)));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<ByteCount>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    let logical = encoded.len() as u64;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(ByteCount {
        logical,
        physical: encoded.len() as u64,
    })
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
