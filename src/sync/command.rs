//! Typed commands
//!
//! Each command kind is a struct with a fixed positional argument list and
//! a typed result. [`Command`] is the closed union that crosses the wire;
//! the meaning of each command is supplied by the server's handler.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::CommandError;
use crate::delta::StateTree;

use super::message::MessageError;

/// Key of the state subtree a prediction writes, usually a device or scene id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    /// Create a target from any string-like id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Target {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A command kind with a wire name and a typed result.
pub trait CommandKind: Into<Command> {
    /// Wire name.
    const NAME: &'static str;

    /// Result carried by a successful reply.
    type Output: DeserializeOwned;

    /// Positional arguments following the name on the wire.
    fn args(&self) -> Vec<Value>;

    /// Decode a reply payload into [`Self::Output`].
    fn decode_output(value: Value) -> Result<Self::Output, CommandError> {
        serde_json::from_value(value).map_err(|e| CommandError::InvalidReply(e.to_string()))
    }
}

/// Flip a device's on/off state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toggle {
    /// Device id.
    pub target: Target,
}

/// Replace part of a device's state.
#[derive(Debug, Clone, PartialEq)]
pub struct SetState {
    /// Device id.
    pub target: Target,
    /// Fields to set.
    pub state: StateTree,
}

/// Activate a stored scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallScene {
    /// Scene id.
    pub scene: Target,
    /// Optional fade duration.
    pub transition_ms: Option<u64>,
}

/// Change a device's display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    /// Device id.
    pub target: Target,
    /// New name.
    pub name: String,
}

/// Round-trip probe answered with the server clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ping;

/// Reply to [`Ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Server wall clock, milliseconds since the Unix epoch.
    pub server_time_ms: u64,
}

impl CommandKind for Toggle {
    const NAME: &'static str = "toggle";
    type Output = ();

    fn args(&self) -> Vec<Value> {
        vec![Value::from(self.target.as_str())]
    }
}

impl CommandKind for SetState {
    const NAME: &'static str = "set-state";
    type Output = ();

    fn args(&self) -> Vec<Value> {
        vec![
            Value::from(self.target.as_str()),
            Value::Object(self.state.clone()),
        ]
    }
}

impl CommandKind for RecallScene {
    const NAME: &'static str = "recall-scene";
    type Output = ();

    fn args(&self) -> Vec<Value> {
        let mut args = vec![Value::from(self.scene.as_str())];
        if let Some(ms) = self.transition_ms {
            args.push(Value::from(ms));
        }
        args
    }
}

impl CommandKind for Rename {
    const NAME: &'static str = "rename";
    type Output = ();

    fn args(&self) -> Vec<Value> {
        vec![
            Value::from(self.target.as_str()),
            Value::from(self.name.as_str()),
        ]
    }
}

impl CommandKind for Ping {
    const NAME: &'static str = "ping";
    type Output = Pong;

    fn args(&self) -> Vec<Value> {
        Vec::new()
    }
}

/// Every command the protocol carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// See [`Toggle`].
    Toggle(Toggle),
    /// See [`SetState`].
    SetState(SetState),
    /// See [`RecallScene`].
    RecallScene(RecallScene),
    /// See [`Rename`].
    Rename(Rename),
    /// See [`Ping`].
    Ping(Ping),
}

macro_rules! impl_into_command {
    ($($kind:ident),*) => {
        $(impl From<$kind> for Command {
            fn from(cmd: $kind) -> Self {
                Command::$kind(cmd)
            }
        })*
    };
}

impl_into_command!(Toggle, SetState, RecallScene, Rename, Ping);

impl Command {
    /// Wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Toggle(_) => Toggle::NAME,
            Self::SetState(_) => SetState::NAME,
            Self::RecallScene(_) => RecallScene::NAME,
            Self::Rename(_) => Rename::NAME,
            Self::Ping(_) => Ping::NAME,
        }
    }

    /// The subtree this command acts on, if any.
    pub fn target(&self) -> Option<&Target> {
        match self {
            Self::Toggle(c) => Some(&c.target),
            Self::SetState(c) => Some(&c.target),
            Self::RecallScene(c) => Some(&c.scene),
            Self::Rename(c) => Some(&c.target),
            Self::Ping(_) => None,
        }
    }

    /// Encode as `[name, ...args]`.
    pub fn encode(&self) -> Vec<Value> {
        let args = match self {
            Self::Toggle(c) => c.args(),
            Self::SetState(c) => c.args(),
            Self::RecallScene(c) => c.args(),
            Self::Rename(c) => c.args(),
            Self::Ping(c) => c.args(),
        };
        let mut out = Vec::with_capacity(args.len() + 1);
        out.push(Value::from(self.name()));
        out.extend(args);
        out
    }

    /// Decode from `[name, ...args]`.
    pub fn decode(payload: &[Value]) -> Result<Self, MessageError> {
        let (name, args) = payload
            .split_first()
            .ok_or(MessageError::MissingField("command"))?;
        let name = name.as_str().ok_or(MessageError::InvalidField {
            field: "command",
            reason: "expected a string".into(),
        })?;
        let args = Args { name, args };

        match name {
            Toggle::NAME => Ok(Toggle {
                target: args.target(0)?,
            }
            .into()),
            SetState::NAME => Ok(SetState {
                target: args.target(0)?,
                state: args.object(1)?,
            }
            .into()),
            RecallScene::NAME => Ok(RecallScene {
                scene: args.target(0)?,
                transition_ms: args.optional_u64(1)?,
            }
            .into()),
            Rename::NAME => Ok(Rename {
                target: args.target(0)?,
                name: args.string(1)?,
            }
            .into()),
            Ping::NAME => Ok(Ping.into()),
            other => Err(MessageError::UnknownCommand(other.to_string())),
        }
    }
}

/// Positional argument reader for [`Command::decode`].
struct Args<'a> {
    name: &'a str,
    args: &'a [Value],
}

impl Args<'_> {
    fn invalid(&self, reason: String) -> MessageError {
        MessageError::InvalidArguments {
            command: self.name.to_string(),
            reason,
        }
    }

    fn string(&self, index: usize) -> Result<String, MessageError> {
        match self.args.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(self.invalid(format!("argument {index} must be a string, got {other}"))),
            None => Err(self.invalid(format!("missing argument {index}"))),
        }
    }

    fn target(&self, index: usize) -> Result<Target, MessageError> {
        self.string(index).map(Target::from)
    }

    fn object(&self, index: usize) -> Result<StateTree, MessageError> {
        match self.args.get(index) {
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(other) => Err(self.invalid(format!("argument {index} must be an object, got {other}"))),
            None => Err(self.invalid(format!("missing argument {index}"))),
        }
    }

    fn optional_u64(&self, index: usize) -> Result<Option<u64>, MessageError> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(format!("argument {index} must be a non-negative integer"))),
        }
    }
}
