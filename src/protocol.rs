//! Wire-level data model and framed-message codec.
//!
//! Every message on a byte stream is a **4-byte big-endian unsigned length
//! prefix** followed by UTF-8 JSON of exactly that many bytes. One framed
//! [`LmRequest`] in, one framed [`LmResponse`] out -- there is no keep-alive.
//!
//! The codec imposes no maximum frame size of its own; callers pass one
//! (default [`DEFAULT_MAX_FRAME_BYTES`]). A declared length above the cap is
//! rejected before the payload is read. Partial frames at EOF fail with
//! [`RlmError::Protocol`].
//!
//! Both an async path (tokio streams, used by the LM Handler and poller) and
//! a sync path (`std::net`, used by the in-sandbox dispatcher) are provided.

use crate::error::{Result, RlmError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Default cap on a single frame's payload: 64 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A normalized LM request. Immutable once submitted.
///
/// `depth` tags the recursion level: 0 is the outer REPL's own call, each
/// nested `llm_query` increments it. The handler rejects requests whose
/// depth exceeds the configured maximum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmRequest {
    /// Unique id for this request. No two concurrent sub-LM calls share one.
    pub request_id: Uuid,
    /// Opaque session identifier, set by the session that spawned the call.
    pub session_id: String,
    /// Ordered conversation.
    pub messages: Vec<ChatMessage>,
    /// Model override. `None` lets the handler's depth routing decide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Recursion level of the caller.
    pub depth: u32,
}

impl LmRequest {
    /// Build a single-user-message request with a fresh request id.
    pub fn from_prompt(session_id: impl Into<String>, prompt: impl Into<String>, depth: u32) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            session_id: session_id.into(),
            messages: vec![ChatMessage::user(prompt)],
            model: None,
            temperature: None,
            max_tokens: None,
            depth,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }
}

/// Token usage for a single LM call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write: Option<u64>,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A normalized LM response.
///
/// Exactly one of `content` / `error` is populated; use [`LmResponse::ok`]
/// and [`LmResponse::err`] rather than building the struct by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmResponse {
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LmResponse {
    /// A successful response carrying generated text.
    pub fn ok(
        request_id: Uuid,
        content: impl Into<String>,
        usage: Usage,
        stop_reason: Option<String>,
    ) -> Self {
        Self {
            request_id,
            content: Some(content.into()),
            usage,
            stop_reason,
            error: None,
        }
    }

    /// An error response carrying a wire error code (`"timeout"`,
    /// `"depth_exceeded"`, `"cancelled"`, …).
    pub fn err(request_id: Uuid, code: impl Into<String>) -> Self {
        Self {
            request_id,
            content: None,
            usage: Usage::default(),
            stop_reason: None,
            error: Some(code.into()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| RlmError::Protocol(format!("frame too large: {} bytes", payload.len())))?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn check_len(len: u32, max_frame: usize) -> Result<usize> {
    let len = len as usize;
    if len > max_frame {
        return Err(RlmError::Protocol(format!(
            "declared frame length {} exceeds cap {}",
            len, max_frame
        )));
    }
    Ok(len)
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| RlmError::Protocol(format!("malformed frame payload: {}", e)))
}

/// Write one framed message to an async stream.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from an async stream, blocking until the full
/// frame is present. A stream that ends mid-frame is a protocol error.
pub async fn read_frame<R, T>(reader: &mut R, max_frame: usize) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| RlmError::Protocol(format!("short read on length prefix: {}", e)))?;
    let len = check_len(u32::from_be_bytes(len_buf), max_frame)?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| RlmError::Protocol(format!("short read on frame payload: {}", e)))?;
    decode(&payload)
}

/// Write one framed message to a blocking stream. Used by the in-sandbox
/// dispatcher, which runs outside the async runtime.
pub fn write_frame_sync<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: std::io::Write,
    T: Serialize,
{
    let buf = encode(msg)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed message from a blocking stream.
pub fn read_frame_sync<R, T>(reader: &mut R, max_frame: usize) -> Result<T>
where
    R: std::io::Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .map_err(|e| RlmError::Protocol(format!("short read on length prefix: {}", e)))?;
    let len = check_len(u32::from_be_bytes(len_buf), max_frame)?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| RlmError::Protocol(format!("short read on frame payload: {}", e)))?;
    decode(&payload)
}
