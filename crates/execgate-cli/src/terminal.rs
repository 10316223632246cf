//! Terminal-side collaborators: an approver that asks on stdin and an
//! event sink that prints notices to stderr.

use std::io::{BufRead, Write};
use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use execgate_traits::{ApprovalDecision, ApprovalPrompt, ApproverChannel, EventSink, ExecEvent};
use tokio::sync::{mpsc, oneshot};

use crate::cli::ApproveAnswer;

/// Asks the user on stdin, or answers with a preset decision.
pub struct TerminalApprover {
    preset: Option<ApproveAnswer>,
}

impl TerminalApprover {
    pub fn new(preset: Option<ApproveAnswer>) -> Self {
        Self { preset }
    }
}

#[async_trait]
impl ApproverChannel for TerminalApprover {
    async fn request_decision(
        &self,
        prompt: &ApprovalPrompt,
    ) -> anyhow::Result<Option<ApprovalDecision>> {
        if let Some(answer) = self.preset {
            return Ok(Some(preset_decision(answer)));
        }

        eprintln!("{}", "Approval required".yellow().bold());
        eprintln!("  command: {}", prompt.command.bold());
        eprintln!("  cwd:     {}", prompt.cwd);
        eprintln!("  host:    {} (security={}, ask={})", prompt.host, prompt.security, prompt.ask);
        if let Some(path) = &prompt.resolved_path {
            eprintln!("  binary:  {path}");
        }
        eprint!("Allow? [o]nce / [a]lways / [d]eny: ");
        std::io::stderr().flush().ok();

        // Detached thread: a blocked stdin read must not hold up runtime shutdown.
        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            let read = std::io::stdin().lock().read_line(&mut line).map(|_| line);
            let _ = tx.send(read);
        });
        match tokio::time::timeout(Duration::from_millis(prompt.timeout_ms), rx).await {
            Ok(received) => {
                let line = received??;
                Ok(parse_answer(&line))
            }
            Err(_) => {
                eprintln!();
                Ok(None)
            }
        }
    }
}

fn preset_decision(answer: ApproveAnswer) -> ApprovalDecision {
    match answer {
        ApproveAnswer::Once => ApprovalDecision::AllowOnce,
        ApproveAnswer::Always => ApprovalDecision::AllowAlways,
        ApproveAnswer::Deny => ApprovalDecision::Deny,
    }
}

/// Empty input or EOF is a denial; anything unrecognized is too.
fn parse_answer(line: &str) -> Option<ApprovalDecision> {
    match line.trim().to_ascii_lowercase().as_str() {
        "o" | "once" | "y" | "yes" => Some(ApprovalDecision::AllowOnce),
        "a" | "always" => Some(ApprovalDecision::AllowAlways),
        _ => Some(ApprovalDecision::Deny),
    }
}

/// Prints every event and forwards terminal ones so the caller can wait
/// for a deferred run to end.
pub struct TerminalSink {
    done: mpsc::UnboundedSender<ExecEvent>,
}

impl TerminalSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecEvent>) {
        let (done, rx) = mpsc::unbounded_channel();
        (Self { done }, rx)
    }
}

impl EventSink for TerminalSink {
    fn emit(&self, context_key: &str, event: ExecEvent) {
        tracing::debug!(context_key, "Exec event");
        let summary = event.summary();
        match &event {
            ExecEvent::ApprovalPending { .. } | ExecEvent::Running { .. } => {
                eprintln!("{} {}", "~".cyan(), summary);
            }
            ExecEvent::Denied { .. } => {
                eprintln!("{} {}", "✗".red(), summary.red());
                let _ = self.done.send(event);
            }
            ExecEvent::Finished { success, .. } => {
                if *success {
                    eprintln!("{} {}", "✓".green(), summary);
                } else {
                    eprintln!("{} {}", "✗".red(), summary);
                }
                let _ = self.done.send(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execgate_traits::{DenialReason, ExecHost};

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("o\n"), Some(ApprovalDecision::AllowOnce));
        assert_eq!(parse_answer(" Always "), Some(ApprovalDecision::AllowAlways));
        assert_eq!(parse_answer(""), Some(ApprovalDecision::Deny));
        assert_eq!(parse_answer("maybe"), Some(ApprovalDecision::Deny));
    }

    #[test]
    fn test_sink_forwards_terminal_events_only() {
        let (sink, mut rx) = TerminalSink::new();
        sink.emit(
            "exec:1",
            ExecEvent::Running {
                approval_id: None,
                session_id: "s1".into(),
                host: ExecHost::Gateway,
                command: "sleep 5".into(),
                elapsed_ms: 5000,
                session_key: "main".into(),
            },
        );
        assert!(rx.try_recv().is_err());

        sink.emit(
            "exec:1",
            ExecEvent::Denied {
                approval_id: Some("1".into()),
                host: ExecHost::Gateway,
                command: "rm -rf /".into(),
                reason: DenialReason::UserDenied,
                session_key: "main".into(),
            },
        );
        assert!(matches!(rx.try_recv(), Ok(ExecEvent::Denied { .. })));
    }

    #[tokio::test]
    async fn test_preset_answers_without_reading_stdin() {
        let approver = TerminalApprover::new(Some(ApproveAnswer::Always));
        let prompt = ApprovalPrompt {
            approval_id: "1".into(),
            command: "ls".into(),
            cwd: "/tmp".into(),
            host: ExecHost::Gateway,
            security: execgate_traits::ExecSecurity::Allowlist,
            ask: execgate_traits::ExecAsk::OnMiss,
            agent_id: "main".into(),
            session_key: "main".into(),
            resolved_path: None,
            timeout_ms: 10,
        };
        let decision = approver.request_decision(&prompt).await.unwrap();
        assert_eq!(decision, Some(ApprovalDecision::AllowAlways));
    }
}
