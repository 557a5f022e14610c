//! Control channel framing.
//!
//! Every message is a 4-byte big-endian length followed by the bincode encoding of
//! a `ControlMessage`. Listener descriptors travel out of band: right after a
//! `SocketHandle` frame the sender writes a single marker byte carrying the
//! descriptors as `SCM_RIGHTS` ancillary data (see `fd`).

use super::HandoffError;
use crate::health::ShardHealthSnapshot;
use directory::DirectorySnapshot;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bumped on any incompatible change to `ControlMessage` or the snapshot layout.
pub const PROTOCOL_VERSION: u32 = 1;

pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// State handed from the predecessor to its successor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffSnapshot {
    /// Includes every migration in progress.
    pub directory: DirectorySnapshot,
    pub health: Vec<ShardHealthSnapshot>,
    pub taken_at_ms: u64,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Hello { protocol_version: u32, pid: u32 },
    /// Names of the listeners whose descriptors follow, in order.
    SocketHandle { names: Vec<String> },
    Ready,
    Snapshot(Box<HandoffSnapshot>),
    SnapshotAck,
    Abort { reason: String },
}

impl ControlMessage {
    pub fn hello() -> Self {
        ControlMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            pid: std::process::id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::SocketHandle { .. } => "socket_handle",
            ControlMessage::Ready => "ready",
            ControlMessage::Snapshot(_) => "snapshot",
            ControlMessage::SnapshotAck => "snapshot_ack",
            ControlMessage::Abort { .. } => "abort",
        }
    }
}

pub async fn write_message<W>(writer: &mut W, message: &ControlMessage) -> Result<(), HandoffError>
where
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(HandoffError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Only exactly the frame's bytes are consumed, so a marker byte
/// carrying descriptors is left in the socket for `fd::recv_fds`.
pub async fn read_message<R>(reader: &mut R) -> Result<ControlMessage, HandoffError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header).await {
        return Err(match err.kind() {
            std::io::ErrorKind::UnexpectedEof => HandoffError::Closed,
            _ => err.into(),
        });
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(HandoffError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let (message, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
    Ok(message)
}
