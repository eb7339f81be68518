//! Control-channel framing
//!
//! ```text
//! [2 bytes: header length, big-endian][JSON header][content bytes]
//! ```
//!
//! The header is `{"byteorder", "content-type", "content-encoding",
//! "content-length"}`. Content is JSON-decoded when its type is `text/json`
//! and passed through as raw bytes otherwise.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CONTENT_TYPE_JSON: &str = "text/json";
pub const CONTENT_TYPE_BINARY: &str = "binary/custom-client-binary-type";

/// Largest accepted content body
pub const MAX_CONTENT_LEN: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireHeader {
    pub byteorder: String,
    #[serde(rename = "content-type")]
    pub content_type: String,
    #[serde(rename = "content-encoding")]
    pub content_encoding: String,
    #[serde(rename = "content-length")]
    pub content_length: usize,
}

/// Decoded frame content
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

impl Content {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(
            serde_json::to_value(value).context("Failed to encode JSON content")?,
        ))
    }

    /// Decode JSON content into a typed value
    pub fn into_typed<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        match self {
            Self::Json(value) => serde_json::from_value(value).context("Unexpected JSON content"),
            Self::Raw(bytes) => anyhow::bail!("Expected JSON content, got {} raw bytes", bytes.len()),
        }
    }
}

fn native_byteorder() -> &'static str {
    if cfg!(target_endian = "big") {
        "big"
    } else {
        "little"
    }
}

/// Build a complete frame
pub fn encode_frame(content: &Content) -> Result<Vec<u8>> {
    let (content_type, body) = match content {
        Content::Json(value) => (
            CONTENT_TYPE_JSON,
            serde_json::to_vec(value).context("Failed to encode JSON content")?,
        ),
        Content::Raw(bytes) => (CONTENT_TYPE_BINARY, bytes.clone()),
    };
    let header = WireHeader {
        byteorder: native_byteorder().to_string(),
        content_type: content_type.to_string(),
        content_encoding: "utf-8".to_string(),
        content_length: body.len(),
    };
    let header_bytes = serde_json::to_vec(&header).context("Failed to encode header")?;
    let header_len = u16::try_from(header_bytes.len()).context("Header too large")?;

    let mut frame = Vec::with_capacity(2 + header_bytes.len() + body.len());
    frame.extend_from_slice(&header_len.to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn decode_content(header: &WireHeader, body: Vec<u8>) -> Result<Content> {
    if header.content_type == CONTENT_TYPE_JSON {
        let value = serde_json::from_slice(&body).context("Invalid JSON content")?;
        Ok(Content::Json(value))
    } else {
        Ok(Content::Raw(body))
    }
}

fn check_content_length(header: &WireHeader) -> Result<()> {
    if header.content_length > MAX_CONTENT_LEN {
        anyhow::bail!("Content too large: {} bytes", header.content_length);
    }
    Ok(())
}

/// Read one frame from a stream
pub async fn read_frame<R>(stream: &mut R) -> Result<Content>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read header length")?;
    let mut header_buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream
        .read_exact(&mut header_buf)
        .await
        .context("Failed to read header")?;
    let header: WireHeader = serde_json::from_slice(&header_buf).context("Invalid frame header")?;
    check_content_length(&header)?;

    let mut body = vec![0u8; header.content_length];
    stream
        .read_exact(&mut body)
        .await
        .context("Failed to read content")?;
    decode_content(&header, body)
}

/// Write one frame to a stream and flush it
pub async fn write_frame<W>(stream: &mut W, content: &Content) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(content)?;
    stream.write_all(&frame).await.context("Failed to write frame")?;
    stream.flush().await.context("Failed to flush stream")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&Content::Json(json!({"action": "list_tasks"}))).unwrap();
        let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let header: serde_json::Value = serde_json::from_slice(&frame[2..2 + header_len]).unwrap();
        assert_eq!(header["content-type"], "text/json");
        assert_eq!(header["content-encoding"], "utf-8");
        assert_eq!(
            header["content-length"].as_u64().unwrap() as usize,
            frame.len() - 2 - header_len
        );
    }

    #[tokio::test]
    async fn test_oversized_content_refused() {
        let header = serde_json::to_vec(&json!({
            "byteorder": "little",
            "content-type": "text/json",
            "content-encoding": "utf-8",
            "content-length": u64::MAX,
        }))
        .unwrap();
        let mut frame = (header.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(&header);

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&frame).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("too large"), "{}", err);
    }

    #[tokio::test]
    async fn test_stream_frames() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Content::Json(json!({"n": 1}))).await.unwrap();
        write_frame(&mut a, &Content::Raw(b"abc".to_vec())).await.unwrap();

        let first = read_frame(&mut b).await.unwrap();
        assert_eq!(first, Content::Json(json!({"n": 1})));
        assert_eq!(read_frame(&mut b).await.unwrap(), Content::Raw(b"abc".to_vec()));
    }
}
