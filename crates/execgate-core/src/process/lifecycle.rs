//! Foreground/background resolution for a dispatched session.

use std::sync::Arc;
use std::time::Duration;

use execgate_traits::{ApprovalSource, EventSink, ExecEvent, ProcessRegistry, SessionHandle};

use crate::models::ExecOutcome;
use crate::process::{ExecutionSession, SessionExit};

const MIN_YIELD_MS: u64 = 10;
const MAX_YIELD_MS: u64 = 120_000;
const RUNNING_TAIL_CHARS: usize = 4_000;
const NOTICE_TAIL_CHARS: usize = 2_000;

/// When the original tool call gives up waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldMode {
    /// `background=true`: hand off right away.
    Immediate,
    After(Duration),
}

/// The requested yield window, or the configured default, clamped to
/// 10 ms..=120 s.
pub fn clamp_yield(requested_ms: Option<u64>, default_ms: u64) -> Duration {
    let ms = requested_ms
        .unwrap_or(default_ms)
        .clamp(MIN_YIELD_MS, MAX_YIELD_MS);
    Duration::from_millis(ms)
}

/// Where a backgrounded session is handed off to.
#[derive(Clone)]
pub struct BackgroundNotice {
    pub registry: Arc<dyn ProcessRegistry>,
    pub events: Arc<dyn EventSink>,
    pub notify_on_exit: bool,
    pub session_key: String,
}

/// Waits for the session to finish or for the yield window to elapse,
/// whichever comes first. Exactly one of the two wins the session phase.
pub async fn settle(
    session: Arc<ExecutionSession>,
    mode: YieldMode,
    notice: &BackgroundNotice,
) -> ExecOutcome {
    match mode {
        YieldMode::Immediate => {
            if session.try_background() {
                hand_off(&session, notice);
                return running_outcome(&session);
            }
        }
        YieldMode::After(window) => {
            tokio::select! {
                _ = session.wait() => {}
                _ = tokio::time::sleep(window) => {
                    if session.try_background() {
                        hand_off(&session, notice);
                        return running_outcome(&session);
                    }
                }
            }
        }
    }

    let exit = session.wait().await;
    if !session.claim_foreground() {
        return running_outcome(&session);
    }
    exit_outcome(&session, &exit)
}

fn hand_off(session: &Arc<ExecutionSession>, notice: &BackgroundNotice) {
    notice.registry.mark_backgrounded(session.clone());
    if !notice.notify_on_exit {
        return;
    }
    let session = session.clone();
    let events = notice.events.clone();
    let session_key = notice.session_key.clone();
    tokio::spawn(async move {
        let exit = session.wait().await;
        events.emit(
            &context_key(session.id()),
            finished_event(&session, &exit, None, None, session_key),
        );
    });
}

fn context_key(id: &str) -> String {
    format!("exec:{id}")
}

fn running_outcome(session: &ExecutionSession) -> ExecOutcome {
    ExecOutcome::Running {
        session_id: session.id().to_string(),
        pid: session.pid(),
        cwd: session.cwd().to_string(),
        tail: session.tail(RUNNING_TAIL_CHARS),
        started_at: session.started_at(),
    }
}

fn exit_outcome(session: &ExecutionSession, exit: &SessionExit) -> ExecOutcome {
    let (output, truncated) = session.output();
    match (exit.success(), exit.failure_reason()) {
        (true, _) | (false, None) => ExecOutcome::Completed {
            session_id: session.id().to_string(),
            exit_code: exit.exit_code.unwrap_or(0),
            duration_ms: exit.duration_ms,
            output,
            truncated,
            cwd: session.cwd().to_string(),
        },
        (false, Some(reason)) => ExecOutcome::Failed {
            session_id: session.id().to_string(),
            exit_code: exit.exit_code,
            duration_ms: exit.duration_ms,
            output,
            reason,
            timed_out: exit.timed_out,
        },
    }
}

pub(crate) fn finished_event(
    session: &ExecutionSession,
    exit: &SessionExit,
    approval_id: Option<String>,
    approved_via: Option<ApprovalSource>,
    session_key: String,
) -> ExecEvent {
    ExecEvent::Finished {
        approval_id,
        session_id: session.id().to_string(),
        host: session.host(),
        command: session.command().to_string(),
        success: exit.success(),
        exit_code: exit.exit_code,
        duration_ms: exit.duration_ms,
        tail: session.tail(NOTICE_TAIL_CHARS),
        approved_via,
        session_key,
    }
}
