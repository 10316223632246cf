//! Persisted approvals file.

use std::collections::BTreeMap;

use execgate_traits::{ExecAsk, ExecSecurity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::policy::PolicyFragment;

/// Agent id whose entries apply to every agent.
pub const WILDCARD_AGENT: &str = "*";

pub const APPROVALS_FILE_VERSION: u32 = 1;

/// One allow pattern with usage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistEntry {
    /// Empty until the entry is first committed by the store.
    #[serde(default)]
    pub id: String,
    pub pattern: String,
    #[serde(default)]
    pub last_used_at: Option<i64>,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resolved_path: Option<String>,
}

fn new_entry_id() -> String {
    Uuid::new_v4().to_string()
}

impl AllowlistEntry {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            id: new_entry_id(),
            pattern: pattern.into(),
            last_used_at: None,
            use_count: 0,
            last_used_command: None,
            last_resolved_path: None,
        }
    }
}

/// Policy knobs stored alongside the allowlist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalsDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<ExecSecurity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<ExecAsk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_fallback: Option<ExecSecurity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentApprovals {
    #[serde(flatten)]
    pub policy: ApprovalsDefaults,
    #[serde(default)]
    pub allowlist: Vec<AllowlistEntry>,
}

impl AgentApprovals {
    pub fn find_mut(&mut self, pattern: &str) -> Option<&mut AllowlistEntry> {
        self.allowlist.iter_mut().find(|e| e.pattern == pattern)
    }
}

/// `exec-approvals.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalsFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<ApprovalsDefaults>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentApprovals>,
}

fn default_version() -> u32 {
    APPROVALS_FILE_VERSION
}

impl Default for ApprovalsFile {
    fn default() -> Self {
        Self {
            version: APPROVALS_FILE_VERSION,
            defaults: None,
            agents: BTreeMap::new(),
        }
    }
}

impl ApprovalsFile {
    /// Patterns for `agent_id` followed by the wildcard agent's patterns.
    pub fn patterns_for(&self, agent_id: &str) -> Vec<String> {
        let mut patterns = Vec::new();
        for key in [agent_id, WILDCARD_AGENT] {
            if let Some(agent) = self.agents.get(key) {
                for entry in &agent.allowlist {
                    if !patterns.contains(&entry.pattern) {
                        patterns.push(entry.pattern.clone());
                    }
                }
            }
            if agent_id == WILDCARD_AGENT {
                break;
            }
        }
        patterns
    }

    /// Policy scopes contributed by this file, most specific first.
    pub fn fragments_for(&self, agent_id: &str) -> Vec<PolicyFragment> {
        let mut fragments = Vec::new();
        if let Some(agent) = self.agents.get(agent_id) {
            fragments.push(fragment(
                format!("approvals.agents.{agent_id}"),
                &agent.policy,
            ));
        }
        if let Some(defaults) = &self.defaults {
            fragments.push(fragment("approvals.defaults".to_string(), defaults));
        }
        fragments
    }

    /// Gives every entry read without an id a fresh one. Returns whether
    /// anything changed.
    pub fn assign_missing_ids(&mut self) -> bool {
        let mut changed = false;
        for entry in self
            .agents
            .values_mut()
            .flat_map(|agent| agent.allowlist.iter_mut())
            .filter(|entry| entry.id.is_empty())
        {
            entry.id = new_entry_id();
            changed = true;
        }
        changed
    }

    pub fn entry_count(&self, agent_id: &str) -> usize {
        self.agents.get(agent_id).map_or(0, |a| a.allowlist.len())
    }
}

fn fragment(scope: String, policy: &ApprovalsDefaults) -> PolicyFragment {
    PolicyFragment {
        scope: Some(scope),
        security: policy.security,
        ask: policy.ask,
        ask_fallback: policy.ask_fallback,
        ..PolicyFragment::default()
    }
}
