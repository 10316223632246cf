//! Event sink contract used for everything that happens after the original
//! tool call has returned.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::policy::ExecHost;

/// Why a request ended without running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum DenialReason {
    UserDenied,
    ApprovalTimeout,
    /// Timed out and the allowlist fallback did not cover the command.
    ApprovalTimeoutAllowlistMiss,
    ApprovalRequestFailed(String),
    DispatchFailed(String),
}

impl DenialReason {
    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserDenied => "user-denied",
            Self::ApprovalTimeout => "approval-timeout",
            Self::ApprovalTimeoutAllowlistMiss => "approval-timeout (allowlist-miss)",
            Self::ApprovalRequestFailed(_) => "approval-request-failed",
            Self::DispatchFailed(_) => "dispatch-failed",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApprovalRequestFailed(detail) | Self::DispatchFailed(detail) => {
                write!(f, "{}: {}", self.code(), detail)
            }
            _ => f.write_str(self.code()),
        }
    }
}

/// How an approved command got its approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalSource {
    AllowOnce,
    AllowAlways,
    Fallback,
}

impl fmt::Display for ApprovalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllowOnce => f.write_str("approved once"),
            Self::AllowAlways => f.write_str("approved always"),
            Self::Fallback => f.write_str("approved via fallback"),
        }
    }
}

/// Fire-and-forget notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ExecEvent {
    ApprovalPending {
        approval_id: String,
        slug: String,
        host: ExecHost,
        command: String,
        cwd: String,
        expires_at_ms: i64,
        session_key: String,
    },
    Denied {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval_id: Option<String>,
        host: ExecHost,
        command: String,
        reason: DenialReason,
        session_key: String,
    },
    Running {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval_id: Option<String>,
        session_id: String,
        host: ExecHost,
        command: String,
        elapsed_ms: u64,
        session_key: String,
    },
    Finished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval_id: Option<String>,
        session_id: String,
        host: ExecHost,
        command: String,
        success: bool,
        exit_code: Option<i32>,
        duration_ms: u64,
        tail: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approved_via: Option<ApprovalSource>,
        session_key: String,
    },
}

impl ExecEvent {
    /// One-line summary suitable for a chat notice.
    pub fn summary(&self) -> String {
        match self {
            Self::ApprovalPending {
                slug, host, command, ..
            } => format!("Approval required ({host} id={slug}): {command}"),
            Self::Denied {
                approval_id,
                host,
                command,
                reason,
                ..
            } => match approval_id {
                Some(id) => format!("Exec denied ({host} id={id}, {reason}): {command}"),
                None => format!("Exec denied ({host}, {reason}): {command}"),
            },
            Self::Running {
                session_id,
                host,
                command,
                elapsed_ms,
                ..
            } => format!(
                "Exec running ({host} session={session_id}, >{}s): {command}",
                elapsed_ms / 1000
            ),
            Self::Finished {
                session_id,
                host,
                exit_code,
                approved_via,
                tail,
                ..
            } => {
                let code = exit_code.map_or_else(|| "?".to_string(), |c| c.to_string());
                let mut line = format!("Exec finished ({host} session={session_id}, code {code})");
                if let Some(via) = approved_via {
                    line.push_str(&format!(", {via}"));
                }
                if !tail.trim().is_empty() {
                    line.push('\n');
                    line.push_str(tail.trim_end());
                }
                line
            }
        }
    }
}

/// Receives notifications. Must not block.
pub trait EventSink: Send + Sync {
    /// `context_key` is stable per request so upstream can dedupe notices.
    fn emit(&self, context_key: &str, event: ExecEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denial_reason_codes() {
        assert_eq!(DenialReason::UserDenied.to_string(), "user-denied");
        assert_eq!(
            DenialReason::ApprovalTimeoutAllowlistMiss.to_string(),
            "approval-timeout (allowlist-miss)"
        );
        assert_eq!(
            DenialReason::ApprovalRequestFailed("socket closed".into()).to_string(),
            "approval-request-failed: socket closed"
        );
    }

    #[test]
    fn test_finished_summary_mentions_fallback() {
        let event = ExecEvent::Finished {
            approval_id: Some("abc".into()),
            session_id: "s1".into(),
            host: ExecHost::Gateway,
            command: "rm -rf build".into(),
            success: true,
            exit_code: Some(0),
            duration_ms: 12,
            tail: String::new(),
            approved_via: Some(ApprovalSource::Fallback),
            session_key: "main".into(),
        };
        let summary = event.summary();
        assert!(summary.contains("code 0"));
        assert!(summary.contains("approved via fallback"));
    }

    #[test]
    fn test_event_tagged_serialization() {
        let event = ExecEvent::Denied {
            approval_id: None,
            host: ExecHost::Node,
            command: "ls".into(),
            reason: DenialReason::UserDenied,
            session_key: "k".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "denied");
        assert_eq!(json["reason"]["kind"], "user-denied");
    }
}
