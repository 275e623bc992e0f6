//! Terminal control frame wire format
//!
//! Every WebSocket message between the browser terminal and the bridge is a
//! single JSON object:
//!
//! ```text
//! {"operation": "stdin" | "stdout" | "resize" | "ping",
//!  "data": "<text>", "rows": <u16>, "cols": <u16>}
//! ```
//!
//! `data` only matters for `stdin`/`stdout`, `rows`/`cols` only for `resize`.
//! Fields that do not apply are ignored on decode and omitted on encode when
//! they hold their zero value.

use std::fmt;

use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Ctrl-D. Handed to the remote side in place of input when the client
/// connection can no longer be read.
pub const END_OF_TRANSMISSION: u8 = 0x04;

/// Error type for frame encoding/decoding
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

// ============================================================================
// Operation
// ============================================================================

/// Frame operation tag
///
/// Unknown tags are kept verbatim in [`Operation::Other`] so that rejecting
/// them is left to whoever dispatches the frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Stdin,
    Stdout,
    Resize,
    Ping,
    Other(String),
}

impl Operation {
    /// Wire representation of the tag
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Stdin => "stdin",
            Operation::Stdout => "stdout",
            Operation::Resize => "resize",
            Operation::Ping => "ping",
            Operation::Other(tag) => tag,
        }
    }
}

impl From<String> for Operation {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "stdin" => Operation::Stdin,
            "stdout" => Operation::Stdout,
            "resize" => Operation::Resize,
            "ping" => Operation::Ping,
            _ => Operation::Other(tag),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Control Frame
// ============================================================================

/// One client <-> bridge message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    pub operation: Operation,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub data: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_zero"
    )]
    pub rows: u16,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "is_zero"
    )]
    pub cols: u16,
}

impl ControlFrame {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            data: String::new(),
            rows: 0,
            cols: 0,
        }
    }

    /// Keystrokes typed by the user
    pub fn stdin(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::new(Operation::Stdin)
        }
    }

    /// Output produced by the remote process
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::new(Operation::Stdout)
        }
    }

    /// New terminal dimensions
    pub fn resize(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            ..Self::new(Operation::Resize)
        }
    }

    /// Client keepalive
    pub fn ping() -> Self {
        Self::new(Operation::Ping)
    }
}

fn is_zero(value: &u16) -> bool {
    *value == 0
}

/// `null` behaves like an absent field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Codec
// ============================================================================

/// Decode a frame from a text message
pub fn decode(text: &str) -> Result<ControlFrame, FrameError> {
    from_object(serde_json::from_str(text).map_err(FrameError::Malformed)?)
}

/// Decode a frame from a binary message
pub fn decode_slice(bytes: &[u8]) -> Result<ControlFrame, FrameError> {
    from_object(serde_json::from_slice(bytes).map_err(FrameError::Malformed)?)
}

/// Only a JSON object is a frame. The derived struct impl would also take
/// the positional array form.
fn from_object(value: Value) -> Result<ControlFrame, FrameError> {
    let unexpected = match &value {
        Value::Object(_) => return serde_json::from_value(value).map_err(FrameError::Malformed),
        Value::Array(_) => Unexpected::Seq,
        Value::String(s) => Unexpected::Str(s),
        Value::Bool(b) => Unexpected::Bool(*b),
        Value::Null => Unexpected::Unit,
        Value::Number(_) => Unexpected::Other("number"),
    };
    Err(FrameError::Malformed(de::Error::invalid_type(
        unexpected,
        &"a JSON object",
    )))
}

/// Encode any frame as a JSON text message
pub fn encode(frame: &ControlFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(FrameError::Encode)
}

/// Wrap raw process output in a `stdout` frame.
///
/// Invalid UTF-8 is replaced with U+FFFD; the frame carries text only.
pub fn encode_output(bytes: &[u8]) -> Result<String, FrameError> {
    encode(&ControlFrame::stdout(String::from_utf8_lossy(bytes)))
}
