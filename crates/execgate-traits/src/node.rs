//! Remote node RPC contract.
//!
//! Only the request/response shapes are defined here; the transport lives
//! outside this workspace.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method that runs a command on a node.
pub const SYSTEM_RUN: &str = "system.run";

/// Method that returns the node's approvals file snapshot.
pub const APPROVALS_GET: &str = "exec.approvals.node.get";

/// A paired companion node as reported by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Operating system of the node, e.g. `linux`, `darwin`, `win32`.
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub connected: bool,
    /// Methods the node advertises.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl NodeInfo {
    pub fn supports(&self, method: &str) -> bool {
        self.commands.iter().any(|c| c == method)
    }
}

/// Parameters of a `system.run` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRunParams {
    pub argv: Vec<String>,
    pub raw_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    pub timeout_ms: u64,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_decision: Option<String>,
    pub run_id: String,
}

/// Result of a `system.run` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRunResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Transport to paired nodes.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeInfo>>;

    async fn invoke(
        &self,
        node_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> anyhow::Result<Value>;
}
