//! Site protocol
//!
//! Messages exchanged between the server and its sites. Sites always
//! initiate: they register once, then pull tasks and push results over the
//! same connection. Messages are MessagePack (rmp-serde) so the serde
//! attributes of the task types carry over unchanged.
//!
//! # Protocol Version
//!
//! Current version: 1
//!
//! # Message Flow
//!
//! ```text
//! Site                               Server
//!   |                                  |
//!   |-- REGISTER(name, version) ------>|
//!   |<------------- REGISTERED --------|
//!   |                                  |
//!   |-- GET_TASK --------------------->|
//!   |<---- NO_TASK(retry_after_ms) ----|
//!   |-- GET_TASK --------------------->|
//!   |<---- ASSIGNMENT(task, payload) --|
//!   |                                  |
//!   |-- SUBMIT_RESULT(task, result) -->|
//!   |<------- RESULT_ACK(accepted) ----|
//!   |                                  |
//!   |-- BYE -------------------------->|
//! ```
//!
//! # Message Framing
//!
//! Each message is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack-serialized message]
//! ```

use crate::task::{Envelope, TaskId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Server and sites must have matching protocol versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted message body
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Site → Server, first message on a connection
    Register(RegisterMessage),

    /// Server → Site, registration accepted
    Registered(RegisteredMessage),

    /// Site → Server, ask for work
    GetTask,

    /// Server → Site, one task to execute
    Assignment(AssignmentMessage),

    /// Server → Site, nothing to do; pull again after the delay
    NoTask { retry_after_ms: u64 },

    /// Site → Server, result of an assigned task
    SubmitResult(SubmitResultMessage),

    /// Server → Site, whether the result reached its task
    ResultAck {
        accepted: bool,
        reason: Option<String>,
    },

    /// Site → Server, clean disconnect
    Bye,

    /// Either direction, fatal for the connection
    Error(ErrorMessage),
}

/// Registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub protocol_version: u32,
    pub site_name: String,
    /// Numeric features the site can serve
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredMessage {
    pub protocol_version: u32,
    pub site_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentMessage {
    pub task_id: TaskId,
    pub task_name: String,
    pub payload: Envelope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResultMessage {
    pub task_id: TaskId,
    pub result: Envelope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub site_name: String,
    pub error: String,
}

/// Serialize a message to bytes
///
/// Returns a length-prefixed MessagePack message.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec(msg).context("Failed to serialize message")?;

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize a message from bytes
///
/// Expects a 4-byte length prefix followed by a MessagePack message.
///
/// # Returns
///
/// Returns (message, bytes_consumed) where bytes_consumed includes the length prefix.
pub fn deserialize_message(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < 4 {
        anyhow::bail!(
            "Buffer too small for message length (need 4 bytes, got {})",
            buf.len()
        );
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + msg_len {
        anyhow::bail!(
            "Incomplete message (need {} bytes, got {})",
            4 + msg_len,
            buf.len()
        );
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len]).context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read one complete message from a stream
pub async fn read_message<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_LEN {
        anyhow::bail!("Message too large: {} bytes (max 100MB)", msg_len);
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    let msg = rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")?;

    Ok(msg)
}

/// Write one message to a stream and flush it
pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = serialize_message(msg)?;

    stream
        .write_all(&framed)
        .await
        .context("Failed to write message")?;
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{DataKind, ReturnCode};

    #[test]
    fn test_serialize_deserialize_assignment() {
        let msg = Message::Assignment(AssignmentMessage {
            task_id: TaskId::new(),
            task_name: "client_stats".to_string(),
            payload: Envelope::ok(DataKind::Analytic, vec![1, 2, 3]).with_round(4),
        });

        let bytes = serialize_message(&msg).unwrap();
        let (decoded, consumed) = deserialize_message(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_incomplete_buffer() {
        let bytes = serialize_message(&Message::GetTask).unwrap();
        assert!(deserialize_message(&bytes[..2]).is_err());
        assert!(deserialize_message(&bytes[..bytes.len() - 1]).is_err());
    }

    #[tokio::test]
    async fn test_stream_exchange() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let result = Message::SubmitResult(SubmitResultMessage {
            task_id: TaskId::new(),
            result: Envelope::reply(ReturnCode::BadTaskData),
        });

        write_message(&mut a, &Message::NoTask { retry_after_ms: 250 })
            .await
            .unwrap();
        write_message(&mut a, &result).await.unwrap();

        assert_eq!(
            read_message(&mut b).await.unwrap(),
            Message::NoTask { retry_after_ms: 250 }
        );
        assert_eq!(read_message(&mut b).await.unwrap(), result);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_MESSAGE_LEN as u32) + 1).to_le_bytes())
            .await
            .unwrap();
        assert!(read_message(&mut b).await.is_err());
    }
}
