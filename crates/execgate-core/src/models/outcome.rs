//! Result of an exec request.

use execgate_traits::ExecHost;
use serde::{Deserialize, Serialize};

/// What the original tool call gets back. Denials are returned as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ExecOutcome {
    Completed {
        session_id: String,
        exit_code: i32,
        duration_ms: u64,
        output: String,
        truncated: bool,
        cwd: String,
    },
    Failed {
        session_id: String,
        exit_code: Option<i32>,
        duration_ms: u64,
        output: String,
        reason: String,
        timed_out: bool,
    },
    Running {
        session_id: String,
        pid: Option<u32>,
        cwd: String,
        tail: String,
        started_at: i64,
    },
    ApprovalPending {
        approval_id: String,
        slug: String,
        expires_at_ms: i64,
        host: ExecHost,
        command: String,
        cwd: String,
    },
}

impl ExecOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Running { .. } => "running",
            Self::ApprovalPending { .. } => "approval-pending",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Completed { session_id, .. }
            | Self::Failed { session_id, .. }
            | Self::Running { session_id, .. } => Some(session_id),
            Self::ApprovalPending { .. } => None,
        }
    }

    /// Text handed back to the agent.
    pub fn to_text(&self) -> String {
        match self {
            Self::Completed {
                output, exit_code, ..
            } => {
                if output.is_empty() {
                    format!("(no output, exit code {exit_code})")
                } else {
                    output.clone()
                }
            }
            Self::Failed { output, reason, .. } => {
                if output.is_empty() {
                    format!("Command failed: {reason}")
                } else {
                    format!("{output}\n\nCommand failed: {reason}")
                }
            }
            Self::Running {
                session_id,
                pid,
                tail,
                ..
            } => {
                let pid = pid.map_or_else(|| "n/a".to_string(), |p| p.to_string());
                let mut text =
                    format!("Command still running (session {session_id}, pid {pid}).");
                if !tail.is_empty() {
                    text.push('\n');
                    text.push_str(tail);
                }
                text
            }
            Self::ApprovalPending {
                slug,
                expires_at_ms,
                host,
                ..
            } => format!(
                "Approval required (id {slug}, host {host}, expires {expires_at_ms}). The result will be delivered when a decision is made."
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_is_tagged_on_status() {
        let outcome = ExecOutcome::Running {
            session_id: "s1".into(),
            pid: Some(42),
            cwd: "/tmp".into(),
            tail: String::new(),
            started_at: 0,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["pid"], 42);
        assert_eq!(outcome.status(), "running");
        assert_eq!(outcome.session_id(), Some("s1"));
    }

    #[test]
    fn test_pending_text_carries_slug() {
        let outcome = ExecOutcome::ApprovalPending {
            approval_id: "abcdef12-3456".into(),
            slug: "abcdef12".into(),
            expires_at_ms: 1,
            host: ExecHost::Gateway,
            command: "rm -rf /".into(),
            cwd: "/".into(),
        };
        assert!(outcome.to_text().contains("abcdef12"));
        assert_eq!(outcome.session_id(), None);
    }
}
