//! The devcontainer outcome document handed back through `SendResult`.

use crate::error::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Build/outcome description produced by the remote agent.
///
/// Only the top-level sections are named; their contents stay opaque JSON
/// and any fields this release does not know about are carried along.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevcontainerResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitution_context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_container_config_with_path: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DevcontainerResult {
    /// Parse the JSON text of a `SendResult` message.
    pub fn parse(text: &str) -> TunnelResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| TunnelError::Protocol(format!("decode result: {e}")))
    }
}
