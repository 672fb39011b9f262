//! Topic-tagged transport frame

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named events exchanged over a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// First message from a monitor or client, and the master's reply
    Register,
    /// Monitor re-attaching after a transport loss
    Reconnect,
    /// Master's reply to `reconnect`
    ReconnectOk,
    /// Master ↔ monitor envelopes
    Monitor,
    /// Master ↔ admin client envelopes
    Client,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Register => "register",
            Topic::Reconnect => "reconnect",
            Topic::ReconnectOk => "reconnect_ok",
            Topic::Monitor => "monitor",
            Topic::Client => "client",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit on the wire: `{"event": <topic>, "data": <payload>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: Topic,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: Topic, data: Value) -> Self {
        Self { event, data }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
