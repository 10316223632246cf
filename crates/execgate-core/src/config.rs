//! Typed configuration for the exec tool.
//!
//! The core never discovers config files on its own; callers hand it a parsed
//! [`ExecGateConfig`] (usually via [`ExecGateConfig::load`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use execgate_traits::{ExecAsk, ExecHost, ExecSecurity};
use serde::{Deserialize, Serialize};

use crate::models::{ElevatedLevel, PolicyFragment};
use crate::security::path_resolver::expand_home;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecGateConfig {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub exec: ExecToolConfig,
    #[serde(default)]
    pub elevated: ElevatedConfig,
}

/// Policy keys that can appear at any scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecPolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<ExecHost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<ExecSecurity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<ExecAsk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_fallback: Option<ExecSecurity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_bins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist: Vec<String>,
}

impl ExecPolicyConfig {
    pub fn to_fragment(&self, scope: impl Into<String>) -> PolicyFragment {
        PolicyFragment {
            scope: Some(scope.into()),
            host: self.host,
            security: self.security,
            ask: self.ask,
            ask_fallback: self.ask_fallback,
            allowlist: self.allowlist.clone(),
            safe_bins: self.safe_bins.clone(),
        }
    }
}

/// `[tools.exec]`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecToolConfig {
    #[serde(flatten)]
    pub policy: ExecPolicyConfig,
    /// Entries prepended to `PATH` on the gateway host.
    #[serde(default)]
    pub path_prepend: Vec<String>,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default = "default_yield_ms")]
    pub yield_ms: u64,
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
    #[serde(default = "default_running_notice_ms")]
    pub approval_running_notice_ms: u64,
    #[serde(default = "default_true")]
    pub notify_on_exit: bool,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    /// Whether PTY-backed runs are permitted on the gateway host.
    #[serde(default = "default_true")]
    pub pty: bool,
    /// Default node for `host=node`.
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub approvals_file: Option<String>,
    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
    #[serde(default)]
    pub by_provider: BTreeMap<String, ExecPolicyConfig>,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self {
            policy: ExecPolicyConfig::default(),
            path_prepend: Vec::new(),
            timeout_sec: default_timeout_sec(),
            yield_ms: default_yield_ms(),
            approval_timeout_ms: default_approval_timeout_ms(),
            approval_running_notice_ms: default_running_notice_ms(),
            notify_on_exit: true,
            max_output_chars: default_max_output_chars(),
            pty: true,
            node: None,
            approvals_file: None,
            sandbox: None,
            by_provider: BTreeMap::new(),
        }
    }
}

/// `[tools.exec.sandbox]`: a long-running container commands are exec'd into.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    pub container: String,
    /// Host directory mounted at `container_workdir`.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,
    #[serde(default = "default_sandbox_path")]
    pub default_path: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
}

impl SandboxConfig {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            workspace_dir: None,
            container_workdir: default_container_workdir(),
            default_path: default_sandbox_path(),
            env: BTreeMap::new(),
            docker_binary: default_docker_binary(),
        }
    }
}

/// `[tools.elevated]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ElevatedConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub level: ElevatedLevel,
    /// Provider → sender ids allowed to elevate. `*` admits every sender.
    #[serde(default)]
    pub allow_from: BTreeMap<String, Vec<String>>,
}

impl ElevatedConfig {
    pub fn allows(&self, provider: Option<&str>, sender: Option<&str>) -> bool {
        let Some(list) = provider.and_then(|p| self.allow_from.get(p)) else {
            return false;
        };
        list.iter()
            .any(|entry| entry == "*" || Some(entry.as_str()) == sender)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub tools: AgentToolsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentToolsConfig {
    #[serde(default)]
    pub exec: ExecPolicyConfig,
    #[serde(default)]
    pub elevated: AgentElevatedConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentElevatedConfig {
    /// `None` inherits the global switch.
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ExecGateConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse exec config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn exec(&self) -> &ExecToolConfig {
        &self.tools.exec
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.get(agent_id)
    }

    /// Path of the approvals file, `~` expanded.
    pub fn approvals_path(&self) -> PathBuf {
        match &self.tools.exec.approvals_file {
            Some(path) => expand_home(path),
            None => default_approvals_path(),
        }
    }
}

pub fn default_approvals_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".execgate")
        .join("exec-approvals.json")
}

fn default_timeout_sec() -> u64 {
    1800
}

fn default_yield_ms() -> u64 {
    10_000
}

fn default_approval_timeout_ms() -> u64 {
    120_000
}

fn default_running_notice_ms() -> u64 {
    10_000
}

fn default_max_output_chars() -> usize {
    200_000
}

fn default_container_workdir() -> String {
    "/workspace".to_string()
}

fn default_sandbox_path() -> String {
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_true() -> bool {
    true
}
