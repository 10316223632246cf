//! Human approval for commands the policy alone does not admit.
//!
//! [`ApprovalWorkflow::begin`] returns immediately with an
//! `approval-pending` outcome; a detached task asks the approver, applies
//! the decision (or the `ask_fallback` on timeout) and, if approved, runs
//! the command in the background and reports through the event sink.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use execgate_traits::{
    ApprovalDecision, ApprovalSource, ApproverChannel, DenialReason, EventSink, ExecAsk,
    ExecEvent, ExecHost, ExecSecurity, ProcessRegistry,
};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DispatchRequest, HostDispatcher};
use crate::models::{ApprovalRequest, ApprovalState, CommandAnalysis, EffectivePolicy, ExecOutcome};
use crate::process::finished_event;
use crate::security::allowlist_store::AllowlistStore;
use crate::security::analyzer::literal_command;

/// Extra time the approver call gets beyond the approval window.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

pub fn requires_approval(
    ask: ExecAsk,
    security: ExecSecurity,
    analysis_ok: bool,
    allowlist_satisfied: bool,
) -> bool {
    match ask {
        ExecAsk::Always => true,
        ExecAsk::OnMiss => {
            let admitted = security == ExecSecurity::Full
                || (security == ExecSecurity::Allowlist && analysis_ok && allowlist_satisfied);
            !admitted
        }
        ExecAsk::Off => false,
    }
}

/// What to do once the approver has answered (or not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalResolution {
    pub state: ApprovalState,
    /// Security the run proceeds under; `None` means do not run.
    pub run_security: Option<ExecSecurity>,
    pub denial: Option<DenialReason>,
    pub source: Option<ApprovalSource>,
    /// Decision forwarded to a node host.
    pub decision: Option<ApprovalDecision>,
}

impl ApprovalResolution {
    fn approved(state: ApprovalState, security: ExecSecurity, source: ApprovalSource) -> Self {
        let decision = match source {
            ApprovalSource::AllowAlways => ApprovalDecision::AllowAlways,
            ApprovalSource::AllowOnce | ApprovalSource::Fallback => ApprovalDecision::AllowOnce,
        };
        Self {
            state,
            run_security: Some(security),
            denial: None,
            source: Some(source),
            decision: Some(decision),
        }
    }

    fn denied(state: ApprovalState, reason: DenialReason) -> Self {
        Self {
            state,
            run_security: None,
            denial: Some(reason),
            source: None,
            decision: None,
        }
    }

    pub fn executes(&self) -> bool {
        self.run_security.is_some()
    }
}

/// Maps an approver answer to a resolution. `None` is a timeout, handled by
/// `ask_fallback`.
pub fn resolve_decision(
    decision: Option<ApprovalDecision>,
    ask_fallback: ExecSecurity,
    analysis_ok: bool,
    allowlist_satisfied: bool,
) -> ApprovalResolution {
    match decision {
        Some(ApprovalDecision::Deny) => {
            ApprovalResolution::denied(ApprovalState::Denied, DenialReason::UserDenied)
        }
        Some(ApprovalDecision::AllowOnce) => ApprovalResolution::approved(
            ApprovalState::ApprovedOnce,
            ExecSecurity::Full,
            ApprovalSource::AllowOnce,
        ),
        Some(ApprovalDecision::AllowAlways) => ApprovalResolution::approved(
            ApprovalState::ApprovedAlways,
            ExecSecurity::Full,
            ApprovalSource::AllowAlways,
        ),
        None => match ask_fallback {
            ExecSecurity::Full => ApprovalResolution::approved(
                ApprovalState::TimedOut,
                ExecSecurity::Full,
                ApprovalSource::Fallback,
            ),
            ExecSecurity::Allowlist if analysis_ok && allowlist_satisfied => {
                ApprovalResolution::approved(
                    ApprovalState::TimedOut,
                    ExecSecurity::Allowlist,
                    ApprovalSource::Fallback,
                )
            }
            ExecSecurity::Allowlist => ApprovalResolution::denied(
                ApprovalState::TimedOut,
                DenialReason::ApprovalTimeoutAllowlistMiss,
            ),
            ExecSecurity::Deny => {
                ApprovalResolution::denied(ApprovalState::TimedOut, DenialReason::ApprovalTimeout)
            }
        },
    }
}

/// Everything the detached continuation needs to finish a request.
#[derive(Debug, Clone)]
pub struct PendingExec {
    pub request: ApprovalRequest,
    pub dispatch: DispatchRequest,
    pub analysis: CommandAnalysis,
    pub policy: EffectivePolicy,
}

pub struct ApprovalWorkflow {
    approver: Arc<dyn ApproverChannel>,
    store: Arc<AllowlistStore>,
    dispatcher: Arc<HostDispatcher>,
    registry: Arc<dyn ProcessRegistry>,
    events: Arc<dyn EventSink>,
    pending: DashMap<String, ApprovalRequest>,
    window: Duration,
    running_notice: Duration,
}

impl ApprovalWorkflow {
    pub fn new(
        approver: Arc<dyn ApproverChannel>,
        store: Arc<AllowlistStore>,
        dispatcher: Arc<HostDispatcher>,
        registry: Arc<dyn ProcessRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let config = dispatcher.config();
        let window = Duration::from_millis(config.approval_timeout_ms);
        let running_notice = Duration::from_millis(config.approval_running_notice_ms);
        Self {
            approver,
            store,
            dispatcher,
            registry,
            events,
            pending: DashMap::new(),
            window,
            running_notice,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests still awaiting a decision, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> =
            self.pending.iter().map(|r| r.value().clone()).collect();
        requests.sort_by_key(|r| r.created_at_ms);
        requests
    }

    /// Registers the request, announces it and starts the continuation.
    pub fn begin(self: &Arc<Self>, exec: PendingExec) -> ExecOutcome {
        let request = exec.request.clone();
        tracing::info!(
            target: "execgate::audit",
            approval_id = %request.id,
            agent_id = %request.agent_id,
            host = %request.host,
            command = %request.command,
            "Approval requested"
        );
        self.pending.insert(request.id.clone(), request.clone());
        self.events.emit(
            &request.context_key(),
            ExecEvent::ApprovalPending {
                approval_id: request.id.clone(),
                slug: request.slug.clone(),
                host: request.host,
                command: request.command.clone(),
                cwd: request.cwd.clone(),
                expires_at_ms: request.expires_at_ms,
                session_key: request.session_key.clone(),
            },
        );

        let workflow = self.clone();
        tokio::spawn(async move {
            workflow.resolve(exec).await;
        });

        ExecOutcome::ApprovalPending {
            approval_id: request.id,
            slug: request.slug,
            expires_at_ms: request.expires_at_ms,
            host: request.host,
            command: request.command,
            cwd: request.cwd,
        }
    }

    async fn resolve(&self, exec: PendingExec) -> ApprovalState {
        let PendingExec {
            request,
            mut dispatch,
            analysis,
            policy,
        } = exec;

        let prompt = request.prompt(self.window.as_millis() as u64);
        let answer = tokio::time::timeout(
            self.window + REQUEST_SLACK,
            self.approver.request_decision(&prompt),
        )
        .await;
        self.pending.remove(&request.id);

        let decision = match answer {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                return self.deny(
                    &request,
                    ApprovalState::Denied,
                    DenialReason::ApprovalRequestFailed(e.to_string()),
                );
            }
            Err(_) => {
                return self.deny(
                    &request,
                    ApprovalState::Denied,
                    DenialReason::ApprovalRequestFailed(format!(
                        "approver did not answer within {} ms",
                        (self.window + REQUEST_SLACK).as_millis()
                    )),
                );
            }
        };

        let resolution = resolve_decision(
            decision,
            policy.ask_fallback,
            analysis.analysis_ok,
            analysis.allowlist_satisfied,
        );
        tracing::info!(
            target: "execgate::audit",
            approval_id = %request.id,
            state = ?resolution.state,
            source = ?resolution.source,
            "Approval resolved"
        );

        let Some(run_security) = resolution.run_security else {
            let reason = resolution.denial.unwrap_or(DenialReason::UserDenied);
            return self.deny(&request, resolution.state, reason);
        };

        if resolution.state == ApprovalState::ApprovedAlways
            && policy.security == ExecSecurity::Allowlist
            && request.host != ExecHost::Node
        {
            self.persist_always(&request.agent_id, &analysis).await;
        }
        self.store
            .record_matches(&request.agent_id, &request.command, &analysis.allowlist_matches)
            .await;

        match literal_command(&analysis, run_security) {
            Ok(sanitized) => dispatch.sanitized_command = sanitized,
            Err(e) => {
                return self.deny(
                    &request,
                    ApprovalState::Denied,
                    DenialReason::DispatchFailed(e.to_string()),
                );
            }
        }
        dispatch.approval = resolution.decision;

        let session = match self.dispatcher.dispatch(dispatch, CancellationToken::new()) {
            Ok(session) => session,
            Err(e) => {
                return self.deny(
                    &request,
                    ApprovalState::Denied,
                    DenialReason::DispatchFailed(e.to_string()),
                );
            }
        };
        session.try_background();
        self.registry.mark_backgrounded(session.clone());

        let context_key = request.context_key();
        let exit = tokio::select! {
            exit = session.wait() => exit,
            _ = tokio::time::sleep(self.running_notice) => {
                self.events.emit(
                    &context_key,
                    ExecEvent::Running {
                        approval_id: Some(request.id.clone()),
                        session_id: session.id().to_string(),
                        host: request.host,
                        command: request.command.clone(),
                        elapsed_ms: session.elapsed_ms(),
                        session_key: request.session_key.clone(),
                    },
                );
                session.wait().await
            }
        };
        self.events.emit(
            &context_key,
            finished_event(
                &session,
                &exit,
                Some(request.id.clone()),
                resolution.source,
                request.session_key.clone(),
            ),
        );
        resolution.state
    }

    async fn persist_always(&self, agent_id: &str, analysis: &CommandAnalysis) {
        for path in analysis.resolved_paths() {
            let pattern = path.to_string_lossy();
            match self.store.add_entry(agent_id, &pattern).await {
                Ok(true) => tracing::info!(agent_id, pattern = %pattern, "Added allowlist entry"),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    agent_id,
                    pattern = %pattern,
                    error = %e,
                    "Failed to persist allowlist entry"
                ),
            }
        }
    }

    fn deny(
        &self,
        request: &ApprovalRequest,
        state: ApprovalState,
        reason: DenialReason,
    ) -> ApprovalState {
        tracing::warn!(
            target: "execgate::audit",
            approval_id = %request.id,
            reason = %reason,
            "Exec denied"
        );
        self.events.emit(
            &request.context_key(),
            ExecEvent::Denied {
                approval_id: Some(request.id.clone()),
                host: request.host,
                command: request.command.clone(),
                reason,
                session_key: request.session_key.clone(),
            },
        );
        state
    }
}
