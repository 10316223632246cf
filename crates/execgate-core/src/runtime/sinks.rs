//! Fallback collaborators used when the host application supplies none.

use async_trait::async_trait;
use execgate_traits::{ApprovalDecision, ApprovalPrompt, ApproverChannel, EventSink, ExecEvent};

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, context_key: &str, event: ExecEvent) {
        tracing::info!(context_key, "{}", event.summary());
    }
}

/// Approver for deployments without a human in the loop. Every request
/// fails, which denies the command.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableApprover;

#[async_trait]
impl ApproverChannel for UnavailableApprover {
    async fn request_decision(
        &self,
        prompt: &ApprovalPrompt,
    ) -> anyhow::Result<Option<ApprovalDecision>> {
        anyhow::bail!(
            "no approver channel configured (approval {})",
            prompt.approval_id
        )
    }
}
