//! Approval request model.

use std::path::Path;

use chrono::Utc;
use execgate_traits::{ApprovalPrompt, ExecAsk, ExecHost, ExecSecurity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalState {
    AwaitingDecision,
    ApprovedOnce,
    ApprovedAlways,
    Denied,
    TimedOut,
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::AwaitingDecision)
    }
}

/// A request for a human decision about one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    /// Short id shown to humans.
    pub slug: String,
    pub command: String,
    pub cwd: String,
    pub host: ExecHost,
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    pub agent_id: String,
    pub session_key: String,
    pub resolved_path: Option<String>,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl ApprovalRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command: impl Into<String>,
        cwd: &Path,
        host: ExecHost,
        security: ExecSecurity,
        ask: ExecAsk,
        agent_id: impl Into<String>,
        session_key: impl Into<String>,
        resolved_path: Option<&Path>,
        window_ms: u64,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let slug = id.chars().take(8).collect();
        let now = Utc::now().timestamp_millis();
        Self {
            id,
            slug,
            command: command.into(),
            cwd: cwd.display().to_string(),
            host,
            security,
            ask,
            agent_id: agent_id.into(),
            session_key: session_key.into(),
            resolved_path: resolved_path.map(|p| p.display().to_string()),
            created_at_ms: now,
            expires_at_ms: now + window_ms as i64,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp_millis() > self.expires_at_ms
    }

    /// Event sink context key.
    pub fn context_key(&self) -> String {
        format!("exec:{}", self.id)
    }

    pub fn prompt(&self, timeout_ms: u64) -> ApprovalPrompt {
        ApprovalPrompt {
            approval_id: self.id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            host: self.host,
            security: self.security,
            ask: self.ask,
            agent_id: self.agent_id.clone(),
            session_key: self.session_key.clone(),
            resolved_path: self.resolved_path.clone(),
            timeout_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_is_id_prefix() {
        let request = ApprovalRequest::new(
            "rm -rf /",
            Path::new("/tmp"),
            ExecHost::Gateway,
            ExecSecurity::Allowlist,
            ExecAsk::OnMiss,
            "main",
            "main",
            None,
            120_000,
        );
        assert_eq!(request.slug.len(), 8);
        assert!(request.id.starts_with(&request.slug));
        assert_eq!(request.expires_at_ms - request.created_at_ms, 120_000);
        assert!(!request.is_expired());
        assert_eq!(request.context_key(), format!("exec:{}", request.id));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ApprovalState::AwaitingDecision.is_terminal());
        assert!(ApprovalState::TimedOut.is_terminal());
        assert!(ApprovalState::ApprovedAlways.is_terminal());
    }
}
