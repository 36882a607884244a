//! Wire messages
//!
//! Every message is a JSON array.
//!
//! Client → server:
//! ```text
//! [transactionId, command, ...args]
//! ```
//!
//! Server → client:
//! ```text
//! ["reply", transactionId, result?, errorMessage?]
//! ["init", protocolVersion, fullStateSnapshot]
//! ["store-delta", delta]
//! ["error", message]
//! ```

use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::core::{MSG_ERROR, MSG_INIT, MSG_REPLY, MSG_STORE_DELTA};
use crate::delta::{Delta, StateTree};

use super::command::Command;

/// A request frame: a transaction id followed by an encoded command.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    /// Transaction id correlating the reply.
    pub id: u64,
    /// `[command, ...args]`, as produced by [`Command::encode`].
    pub payload: Vec<Value>,
}

impl ClientFrame {
    /// Create a frame from an id and an encoded command.
    pub fn new(id: u64, payload: Vec<Value>) -> Self {
        Self { id, payload }
    }

    /// Encode to wire format (`[id, ...payload]`).
    pub fn encode(&self) -> String {
        let mut items = Vec::with_capacity(self.payload.len() + 1);
        items.push(Value::from(self.id));
        items.extend(self.payload.iter().cloned());
        Value::Array(items).to_string()
    }

    /// Decode from wire format.
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let mut items = parse_array(text)?;
        if items.is_empty() {
            return Err(MessageError::Empty);
        }
        let id = items[0].as_u64().ok_or(MessageError::InvalidField {
            field: "transactionId",
            reason: "expected a non-negative integer".into(),
        })?;
        items.remove(0);
        Ok(Self { id, payload: items })
    }

    /// Best-effort extraction of the transaction id from a frame that
    /// failed to decode, so the server can still reply with an error.
    pub fn peek_id(text: &str) -> Option<u64> {
        serde_json::from_str::<Vec<Value>>(text)
            .ok()?
            .first()
            .and_then(Value::as_u64)
    }

    /// Decode the payload into a typed command.
    pub fn command(&self) -> Result<Command, MessageError> {
        Command::decode(&self.payload)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Reply to a client transaction.
    Reply {
        /// Transaction id being answered.
        id: u64,
        /// Success payload (`null` when absent).
        result: Value,
        /// Failure reason; `Some` means the command failed.
        error: Option<String>,
    },

    /// Full state snapshot, sent once per connection after authentication.
    Init {
        /// Protocol version spoken by the server.
        version: u32,
        /// Public state tree.
        snapshot: StateTree,
    },

    /// Canonical state change.
    StoreDelta(Delta),

    /// Server-forced connection failure.
    Error(String),
}

impl ServerMessage {
    /// Successful reply.
    pub fn ok(id: u64, result: Value) -> Self {
        Self::Reply {
            id,
            result,
            error: None,
        }
    }

    /// Failed reply.
    pub fn failed(id: u64, error: impl Into<String>) -> Self {
        Self::Reply {
            id,
            result: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Encode to wire format.
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Reply {
                id,
                result,
                error: Some(error),
            } => json!([MSG_REPLY, id, result, error]),
            Self::Reply {
                id,
                result,
                error: None,
            } => json!([MSG_REPLY, id, result]),
            Self::Init { version, snapshot } => json!([MSG_INIT, version, snapshot]),
            Self::StoreDelta(delta) => json!([MSG_STORE_DELTA, delta]),
            Self::Error(message) => json!([MSG_ERROR, message]),
        };
        value.to_string()
    }

    /// Decode from wire format.
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let items = parse_array(text)?;
        let (tag, rest) = items.split_first().ok_or(MessageError::Empty)?;
        let tag = tag.as_str().ok_or(MessageError::InvalidField {
            field: "tag",
            reason: "expected a string".into(),
        })?;

        match tag {
            MSG_REPLY => {
                let id = rest
                    .first()
                    .ok_or(MessageError::MissingField("transactionId"))?
                    .as_u64()
                    .ok_or(MessageError::InvalidField {
                        field: "transactionId",
                        reason: "expected a non-negative integer".into(),
                    })?;
                let result = rest.get(1).cloned().unwrap_or(Value::Null);
                let error = rest.get(2).and_then(error_text);
                Ok(Self::Reply { id, result, error })
            }
            MSG_INIT => {
                let version = rest
                    .first()
                    .ok_or(MessageError::MissingField("protocolVersion"))?
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or(MessageError::InvalidField {
                        field: "protocolVersion",
                        reason: "expected a 32-bit unsigned integer".into(),
                    })?;
                let snapshot = match rest.get(1) {
                    Some(Value::Object(map)) => map.clone(),
                    Some(_) => {
                        return Err(MessageError::InvalidField {
                            field: "snapshot",
                            reason: "expected an object".into(),
                        });
                    }
                    None => return Err(MessageError::MissingField("snapshot")),
                };
                Ok(Self::Init { version, snapshot })
            }
            MSG_STORE_DELTA => match rest.first() {
                Some(Value::Object(map)) => Ok(Self::StoreDelta(map.clone())),
                Some(_) => Err(MessageError::InvalidField {
                    field: "delta",
                    reason: "expected an object".into(),
                }),
                None => Err(MessageError::MissingField("delta")),
            },
            MSG_ERROR => {
                let message = rest
                    .first()
                    .and_then(error_text)
                    .unwrap_or_else(|| "unspecified server error".to_string());
                Ok(Self::Error(message))
            }
            other => Err(MessageError::UnknownTag(other.to_string())),
        }
    }
}

/// Interpret an error slot: absent, `null`, `false`, `0` and `""` mean
/// "no error"; strings are used verbatim and anything else is stringified.
fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        other => Some(other.to_string()),
    }
}

fn parse_array(text: &str) -> Result<Vec<Value>, MessageError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => Err(MessageError::NotAnArray),
        Err(e) => {
            debug!(error = %e, "undecodable frame");
            Err(MessageError::InvalidJson(e.to_string()))
        }
    }
}

/// Wire message encoding/decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Input was not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),

    /// Input was JSON but not an array.
    #[error("message is not an array")]
    NotAnArray,

    /// Input was an empty array.
    #[error("message is empty")]
    Empty,

    /// The leading tag is not a known message type.
    #[error("unknown message type: {0}")]
    UnknownTag(String),

    /// A required positional field is missing.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A positional field has the wrong shape.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// The command name is not part of the protocol.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The command's arguments have the wrong shape.
    #[error("invalid arguments for {command}: {reason}")]
    InvalidArguments {
        /// Command name.
        command: String,
        /// What was wrong.
        reason: String,
    },
}
