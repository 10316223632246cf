//! Shared fakes for the exec integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use execgate_core::security::AllowlistStore;
use execgate_core::{ExecGateConfig, ExecRunner};
use execgate_traits::{
    ApprovalDecision, ApprovalPrompt, ApproverChannel, EventSink, ExecAsk, ExecEvent, ExecHost,
    ExecSecurity,
};
use parking_lot::Mutex;

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(String, ExecEvent)>>,
}

impl EventSink for RecordingSink {
    fn emit(&self, context_key: &str, event: ExecEvent) {
        self.events.lock().push((context_key.to_string(), event));
    }
}

impl RecordingSink {
    pub fn snapshot(&self) -> Vec<(String, ExecEvent)> {
        self.events.lock().clone()
    }

    /// Polls until `pred` holds for the recorded events.
    pub async fn wait_for<F>(&self, pred: F) -> Vec<(String, ExecEvent)>
    where
        F: Fn(&[(String, ExecEvent)]) -> bool,
    {
        for _ in 0..500 {
            {
                let events = self.events.lock();
                if pred(&events) {
                    return events.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for events: {:?}", self.snapshot());
    }
}

pub fn has_finished(events: &[(String, ExecEvent)]) -> bool {
    events
        .iter()
        .any(|(_, e)| matches!(e, ExecEvent::Finished { .. }))
}

pub fn has_denied(events: &[(String, ExecEvent)]) -> bool {
    events
        .iter()
        .any(|(_, e)| matches!(e, ExecEvent::Denied { .. }))
}

/// Answers every prompt with a fixed decision after `delay`.
pub struct ScriptedApprover {
    pub answer: Option<ApprovalDecision>,
    pub delay: Duration,
    pub prompts: Mutex<Vec<ApprovalPrompt>>,
}

impl ScriptedApprover {
    pub fn answering(answer: Option<ApprovalDecision>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            delay: Duration::from_millis(20),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ApproverChannel for ScriptedApprover {
    async fn request_decision(
        &self,
        prompt: &ApprovalPrompt,
    ) -> anyhow::Result<Option<ApprovalDecision>> {
        self.prompts.lock().push(prompt.clone());
        tokio::time::sleep(self.delay).await;
        Ok(self.answer)
    }
}

pub fn gateway_config(
    security: ExecSecurity,
    ask: ExecAsk,
    ask_fallback: ExecSecurity,
    allowlist: Vec<String>,
) -> ExecGateConfig {
    let mut config = ExecGateConfig::default();
    let exec = &mut config.tools.exec;
    exec.policy.host = Some(ExecHost::Gateway);
    exec.policy.security = Some(security);
    exec.policy.ask = Some(ask);
    exec.policy.ask_fallback = Some(ask_fallback);
    exec.policy.allowlist = allowlist;
    exec.approval_timeout_ms = 500;
    exec.pty = false;
    config
}

pub fn store_in(dir: &Path) -> Arc<AllowlistStore> {
    Arc::new(AllowlistStore::new(dir.join("exec-approvals.json")))
}

pub struct Harness {
    pub runner: ExecRunner,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<AllowlistStore>,
}

pub fn harness(
    config: ExecGateConfig,
    dir: &Path,
    approver: Arc<dyn ApproverChannel>,
) -> Harness {
    let sink = Arc::new(RecordingSink::default());
    let store = store_in(dir);
    let runner = ExecRunner::builder(config)
        .approver(approver)
        .events(sink.clone())
        .store(store.clone())
        .build();
    Harness {
        runner,
        sink,
        store,
    }
}

pub fn resolved(bin: &str) -> String {
    which::which(bin)
        .unwrap_or_else(|e| panic!("{bin} not on PATH: {e}"))
        .display()
        .to_string()
}
