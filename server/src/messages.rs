//! Wire format shared by server and client.
//!
//! Every frame is a 4-byte big-endian length followed by a compact JSON
//! [`Packet`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Message,
    Command,
}

/// One logical message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub message_type: MessageType,
    pub payload: String,
}

impl Packet {
    pub fn message(payload: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Message,
            payload: payload.into(),
        }
    }

    pub fn command(payload: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Command,
            payload: payload.into(),
        }
    }

    /// Classification is by payload, not by the declared type: a leading `/`
    /// makes it a command.
    pub fn is_command(&self) -> bool {
        self.payload.starts_with('/')
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.message_type {
            MessageType::Message => "MESSAGE",
            MessageType::Command => "COMMAND",
        };
        write!(f, "[{}] {}", kind, self.payload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error("malformed packet: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads one frame. `Ok(None)` means the peer closed cleanly on a frame
/// boundary; a close anywhere else is [`FrameError::Truncated`].
pub async fn read_packet<R>(reader: &mut R, max_len: usize) -> Result<Option<Packet>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
        _ => FrameError::Io(e),
    })?;

    Ok(Some(serde_json::from_slice(&data)?))
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(packet)?;
    let len = u32::try_from(json.len()).map_err(|_| FrameError::TooLarge {
        len: json.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(4 + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
