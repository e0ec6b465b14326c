/// Terminal protocol messages exchanged over a [`crate::protocol::TerminalConnection`].
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{ConnectionError, ConnectionResult};

/// Client → server messages, sent as JSON text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keyboard input for the terminal
    Stdin { data: String },
    Resize { rows: u16, cols: u16 },
    Ping,
}

impl ClientMessage {
    /// Parse a text frame. Besides the tagged object form this accepts the
    /// array form `["stdin", data]` / `["set_size", rows, cols]`.
    pub fn parse(text: &str) -> ConnectionResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ConnectionError::Deserialization(e.to_string()))?;
        match value {
            Value::Array(items) => Self::from_array(&items),
            value => serde_json::from_value(value)
                .map_err(|e| ConnectionError::Deserialization(e.to_string())),
        }
    }

    fn from_array(items: &[Value]) -> ConnectionResult<Self> {
        match items {
            [Value::String(kind), Value::String(data)] if kind == "stdin" => Ok(Self::Stdin {
                data: data.clone(),
            }),
            [Value::String(kind), rows, cols] if kind == "set_size" => Ok(Self::Resize {
                rows: dimension(rows)?,
                cols: dimension(cols)?,
            }),
            _ => Err(ConnectionError::Deserialization(format!(
                "unsupported message: {}",
                Value::from(items.to_vec())
            ))),
        }
    }
}

fn dimension(value: &Value) -> ConnectionResult<u16> {
    value
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| ConnectionError::Deserialization(format!("invalid dimension: {}", value)))
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output { data: String },
    /// `code` is null when the child was killed
    Exit { code: Option<i32> },
    Size { rows: u16, cols: u16 },
}

impl ServerMessage {
    pub fn to_json(&self) -> ConnectionResult<String> {
        serde_json::to_string(self).map_err(|e| ConnectionError::Serialization(e.to_string()))
    }
}

/// A frame ready to go out on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Turns raw pty output into frames.
///
/// UTF-8 output becomes `output` messages. A multi-byte character split
/// across two chunks is held back until its remaining bytes arrive; output
/// that is not UTF-8 at all goes out as a binary frame.
#[derive(Debug, Default)]
pub struct OutputEncoder {
    carry: Vec<u8>,
}

impl OutputEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one chunk. Returns `None` when everything was held back.
    pub fn encode(&mut self, chunk: &[u8]) -> ConnectionResult<Option<OutboundFrame>> {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);
        if bytes.is_empty() {
            return Ok(None);
        }

        let text = match std::str::from_utf8(&bytes) {
            Ok(text) => text.to_string(),
            Err(e) if e.error_len().is_none() => {
                // truncated sequence at the end: wait for the rest
                let valid = e.valid_up_to();
                self.carry = bytes.split_off(valid);
                if bytes.is_empty() {
                    return Ok(None);
                }
                String::from_utf8(bytes).map_err(|e| ConnectionError::Other(e.to_string()))?
            }
            Err(_) => return Ok(Some(OutboundFrame::Binary(bytes))),
        };
        let message = ServerMessage::Output { data: text };
        Ok(Some(OutboundFrame::Text(message.to_json()?)))
    }

    /// Whatever is still held back, as a binary frame.
    pub fn flush(&mut self) -> Option<OutboundFrame> {
        if self.carry.is_empty() {
            None
        } else {
            Some(OutboundFrame::Binary(std::mem::take(&mut self.carry)))
        }
    }
}
