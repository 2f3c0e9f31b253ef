//! Message types of the tunnel protocol and the RPC frames that carry them.
//!
//! Credential and user payloads travel as JSON text inside [`Message`] so
//! peers built from different releases can evolve those shapes independently.
//! [`Message::encode`] / [`Message::decode`] convert at the boundary.

use crate::error::{Status, TunnelError, TunnelResult};
use bytes::Bytes;
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Client-assigned call identifier, unique per connection.
pub type CallId = u64;

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Request {
        id: CallId,
        method: String,
        body: Value,
    },
    Response {
        id: CallId,
        body: Value,
    },
    /// One element of a streaming reply.
    Item {
        id: CallId,
        body: Value,
    },
    /// End of a streaming reply.
    End {
        id: CallId,
    },
    Error {
        id: CallId,
        status: Status,
    },
    /// Sent by the caller when it abandons a call.
    Cancel {
        id: CallId,
    },
}

impl Frame {
    pub fn id(&self) -> CallId {
        match self {
            Frame::Request { id, .. }
            | Frame::Response { id, .. }
            | Frame::Item { id, .. }
            | Frame::End { id }
            | Frame::Error { id, .. }
            | Frame::Cancel { id } => *id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

/// Generic one-field envelope around a JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Serialize `value` as JSON into a new envelope.
    pub fn encode<T: Serialize>(value: &T) -> TunnelResult<Self> {
        Ok(Self {
            message: serde_json::to_string(value)?,
        })
    }

    /// Parse the envelope's JSON text.
    pub fn decode<T: DeserializeOwned>(&self) -> TunnelResult<T> {
        serde_json::from_str(&self.message).map_err(|e| TunnelError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    pub log_level: LogLevel,
    pub message: String,
}

/// One piece of a byte stream (workspace archive, mount archive).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRequest {
    pub port: String,
}

impl PortRequest {
    pub fn new(port: impl Into<String>) -> Self {
        Self { port: port.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRequest {
    pub mount: String,
}
