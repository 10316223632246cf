//! Approver channel contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::policy::{ExecAsk, ExecHost, ExecSecurity};

/// Decision returned by a human approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    Deny,
    AllowOnce,
    AllowAlways,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::AllowOnce => "allow-once",
            Self::AllowAlways => "allow-always",
        }
    }
}

/// Everything an approver needs to show a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPrompt {
    pub approval_id: String,
    pub command: String,
    pub cwd: String,
    pub host: ExecHost,
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    pub agent_id: String,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
    /// How long the approver may wait for a human before answering `None`.
    pub timeout_ms: u64,
}

/// Channel used to solicit a decision.
///
/// Implementations return `Ok(None)` when nobody answered within
/// `prompt.timeout_ms`. Any `Err` is treated as a denial by the caller.
#[async_trait]
pub trait ApproverChannel: Send + Sync {
    async fn request_decision(
        &self,
        prompt: &ApprovalPrompt,
    ) -> anyhow::Result<Option<ApprovalDecision>>;
}
