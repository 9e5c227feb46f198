//! # Wire Protocol
//!
//! Messages exchanged on a peer session, framed as a big-endian `u32` length
//! followed by a bincode body. Frames above [`MAX_FRAME_LEN`] are rejected
//! before allocation.
//!
//! A session starts with both sides sending [`Hello`], then one [`Message::Proof`]
//! each. Everything after that is summaries, `Have` announcements and
//! correlated request/response pairs.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::crypto::Hash;
use crate::error::{Result, SyncError};
use crate::index::{FileEntry, IndexSummary};
use crate::secret::{FolderId, Level};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const CTX_PROOF: &str = "lvlt 2024-05 handshake proof";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub folder_id: FolderId,
    pub node_id: [u8; 32],
    /// Level of the Secret form this side holds.
    pub level: Level,
    pub nonce: [u8; 32],
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    /// Signed entry for a path, including its chunk manifest.
    Entry { path: String },
    /// Encrypted chunk by address.
    Chunk { hash: Hash },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    Entry(Option<FileEntry>),
    Chunk { hash: Hash, data: Vec<u8> },
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello(Hello),
    Proof { mac: [u8; 32] },
    IndexSummary(IndexSummary),
    /// Offer of a newer entry by a writer.
    Have(FileEntry),
    Request { id: Uuid, body: RequestBody },
    Response { id: Uuid, body: ResponseBody },
    Ping,
    Bye,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Proof { .. } => "proof",
            Message::IndexSummary(_) => "index-summary",
            Message::Have(_) => "have",
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Ping => "ping",
            Message::Bye => "bye",
        }
    }
}

/// Write one framed message, returning the number of bytes put on the wire.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(SyncError::Protocol(format!("frame too large: {} bytes", body.len())));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(body.len() + 4)
}

/// Read one framed message. `Ok(None)` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<(Message, usize)>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SyncError::Protocol(format!("frame too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SyncError::Transport("stream ended mid-frame".into())
        } else {
            e.into()
        }
    })?;
    Ok(Some((bincode::deserialize(&body)?, len + 4)))
}

/// MAC proving possession of a level's auth key. Binds the challenger's
/// nonce, the prover's nonce and the prover's node id, so a proof cannot be
/// reflected back at its sender.
pub fn proof_mac(auth_key: &[u8; 32], challenger_nonce: &[u8; 32], prover_nonce: &[u8; 32], prover_node: &[u8; 32]) -> [u8; 32] {
    let key = blake3::derive_key(CTX_PROOF, auth_key);
    let mut hasher = blake3::Hasher::new_keyed(&key);
    hasher.update(challenger_nonce);
    hasher.update(prover_nonce);
    hasher.update(prover_node);
    hasher.finalize().into()
}
