//! The exec tool: policy, analysis, approval, dispatch and yield in one call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use execgate_traits::{
    ApproverChannel, EventSink, ExecHost, ExecSecurity, NodeRpc, ProcessRegistry,
};
use serde_json::Value;

use crate::config::ExecGateConfig;
use crate::dispatch::gateway;
use crate::dispatch::node::{fetch_node_approvals, node_platform, select_node};
use crate::dispatch::{DispatchRequest, HostDispatcher};
use crate::error::{ExecError, Result};
use crate::models::{ApprovalRequest, ExecContext, ExecOutcome, ExecRequest};
use crate::process::{BackgroundNotice, InMemoryProcessRegistry, YieldMode, clamp_yield, settle};
use crate::runtime::sinks::{LogEventSink, UnavailableApprover};
use crate::security::analyzer::{analyze, literal_command};
use crate::security::approval::{ApprovalWorkflow, PendingExec, requires_approval};
use crate::security::path_resolver::{Platform, expand_home};
use crate::security::policy::{PolicyResolver, fold_node_policy};
use crate::security::{AllowlistStore, validate_host_env};

/// Upper bound on a single command's run time.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

pub struct ExecRunner {
    config: Arc<ExecGateConfig>,
    store: Arc<AllowlistStore>,
    dispatcher: Arc<HostDispatcher>,
    approvals: Arc<ApprovalWorkflow>,
    registry: Arc<dyn ProcessRegistry>,
    events: Arc<dyn EventSink>,
}

pub struct ExecRunnerBuilder {
    config: ExecGateConfig,
    approver: Option<Arc<dyn ApproverChannel>>,
    registry: Option<Arc<dyn ProcessRegistry>>,
    events: Option<Arc<dyn EventSink>>,
    nodes: Option<Arc<dyn NodeRpc>>,
    store: Option<Arc<AllowlistStore>>,
}

impl ExecRunnerBuilder {
    pub fn approver(mut self, approver: Arc<dyn ApproverChannel>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ProcessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn nodes(mut self, nodes: Arc<dyn NodeRpc>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Overrides the store built from `tools.exec.approvals_file`.
    pub fn store(mut self, store: Arc<AllowlistStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> ExecRunner {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(AllowlistStore::new(self.config.approvals_path())));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(InMemoryProcessRegistry::new()));
        let events = self.events.unwrap_or_else(|| Arc::new(LogEventSink));
        let approver = self
            .approver
            .unwrap_or_else(|| Arc::new(UnavailableApprover));

        let mut dispatcher = HostDispatcher::new(self.config.exec().clone());
        if let Some(nodes) = self.nodes {
            dispatcher = dispatcher.with_nodes(nodes);
        }
        let dispatcher = Arc::new(dispatcher);
        let approvals = Arc::new(ApprovalWorkflow::new(
            approver,
            store.clone(),
            dispatcher.clone(),
            registry.clone(),
            events.clone(),
        ));

        ExecRunner {
            config: Arc::new(self.config),
            store,
            dispatcher,
            approvals,
            registry,
            events,
        }
    }
}

impl ExecRunner {
    pub fn builder(config: ExecGateConfig) -> ExecRunnerBuilder {
        ExecRunnerBuilder {
            config,
            approver: None,
            registry: None,
            events: None,
            nodes: None,
            store: None,
        }
    }

    pub fn config(&self) -> &ExecGateConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<AllowlistStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<dyn ProcessRegistry> {
        &self.registry
    }

    pub fn approvals(&self) -> &Arc<ApprovalWorkflow> {
        &self.approvals
    }

    /// JSON schema of the tool input.
    pub fn parameters_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (defaults to the current directory)"
                },
                "env": {
                    "type": "object",
                    "additionalProperties": { "type": "string" },
                    "description": "Extra environment variables"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 1800)"
                },
                "pty": {
                    "type": "boolean",
                    "description": "Run under a pseudo terminal (gateway host only)"
                },
                "background": {
                    "type": "boolean",
                    "description": "Return immediately and keep running in the background"
                },
                "yield_ms": {
                    "type": "integer",
                    "description": "Milliseconds to wait before backgrounding (default: 10000)"
                },
                "elevated": {
                    "type": "boolean",
                    "description": "Run on the gateway host if elevation is permitted"
                },
                "host": { "type": "string", "enum": ["sandbox", "gateway", "node"] },
                "security": { "type": "string", "enum": ["deny", "allowlist", "full"] },
                "ask": { "type": "string", "enum": ["off", "on-miss", "always"] },
                "node": {
                    "type": "string",
                    "description": "Node id or display name for host=node"
                }
            },
            "required": ["command"]
        })
    }

    /// Runs a raw tool call.
    pub async fn execute_json(&self, input: Value, ctx: ExecContext) -> Result<ExecOutcome> {
        let request: ExecRequest = serde_json::from_value(input)
            .map_err(|e| ExecError::InvalidRequest(format!("invalid exec input: {e}")))?;
        self.execute(request, ctx).await
    }

    pub async fn execute(&self, request: ExecRequest, ctx: ExecContext) -> Result<ExecOutcome> {
        let command = request.command.trim();
        if command.is_empty() {
            return Err(ExecError::InvalidRequest("command is required".to_string()));
        }
        let exec = self.config.exec();

        let approvals_file = self.store.load().await?;
        let mut policy =
            PolicyResolver::new(&self.config).resolve_request(&request, &ctx, &approvals_file)?;
        let workdir = self.resolve_workdir(request.workdir.as_deref(), policy.host)?;

        let (node, platform) = if policy.host == ExecHost::Node {
            let rpc = self.dispatcher.nodes().ok_or_else(|| {
                ExecError::NodeUnavailable("no node transport configured".to_string())
            })?;
            let node = select_node(rpc.as_ref(), request.node.as_deref(), exec.node.as_deref())
                .await?;
            let node_file = fetch_node_approvals(rpc.as_ref(), &node).await;
            policy = fold_node_policy(&policy, &node_file, &ctx.agent_id);
            let platform = node_platform(&node);
            (Some(node), platform)
        } else {
            (None, Platform::current())
        };

        if policy.security == ExecSecurity::Deny {
            tracing::warn!(
                target: "execgate::audit",
                agent_id = %ctx.agent_id,
                host = %policy.host,
                command,
                "Exec denied by security=deny"
            );
            return Err(ExecError::SecurityDeny(policy.host));
        }

        let analysis = if node.is_some() {
            analyze(
                command,
                &policy.allowlist,
                &policy.safe_bins,
                &workdir,
                &request.env,
                platform,
            )
        } else {
            let env = self.analysis_env(&request.env, policy.host)?;
            self.store
                .evaluate(&ctx.agent_id, command, &policy, &workdir, &env, platform)
                .await?
        };
        tracing::debug!(
            agent_id = %ctx.agent_id,
            analysis_ok = analysis.analysis_ok,
            allowlist_satisfied = analysis.allowlist_satisfied,
            segments = analysis.segments.len(),
            "Analyzed command"
        );

        let timeout_secs = request
            .timeout
            .unwrap_or(exec.timeout_sec)
            .clamp(1, MAX_TIMEOUT_SECS);
        let mut dispatch = DispatchRequest {
            command: command.to_string(),
            sanitized_command: None,
            workdir,
            env: request.env.clone(),
            host: policy.host,
            pty: request.pty,
            timeout: Duration::from_secs(timeout_secs),
            node,
            approval: None,
        };

        if requires_approval(
            policy.ask,
            policy.security,
            analysis.analysis_ok,
            analysis.allowlist_satisfied,
        ) {
            let approval = ApprovalRequest::new(
                command,
                &dispatch.workdir,
                policy.host,
                policy.security,
                policy.ask,
                &ctx.agent_id,
                &ctx.session_key,
                analysis.primary_resolved_path().map(PathBuf::as_path),
                self.approvals.window().as_millis() as u64,
            );
            return Ok(self.approvals.begin(PendingExec {
                request: approval,
                dispatch,
                analysis,
                policy,
            }));
        }

        if policy.security == ExecSecurity::Allowlist && !analysis.allowlist_satisfied {
            let reason = analysis
                .failure_reason
                .clone()
                .unwrap_or_else(|| "command is not covered by the allowlist".to_string());
            tracing::warn!(
                target: "execgate::audit",
                agent_id = %ctx.agent_id,
                command,
                reason = %reason,
                "Exec denied by allowlist"
            );
            return Err(ExecError::AllowlistMiss(reason));
        }

        dispatch.sanitized_command = literal_command(&analysis, policy.security)?;
        self.store
            .record_matches(&ctx.agent_id, command, &analysis.allowlist_matches)
            .await;

        let session = self.dispatcher.dispatch(dispatch, ctx.cancel.clone())?;
        let mode = if request.background {
            YieldMode::Immediate
        } else {
            YieldMode::After(clamp_yield(request.yield_ms, exec.yield_ms))
        };
        let notice = BackgroundNotice {
            registry: self.registry.clone(),
            events: self.events.clone(),
            notify_on_exit: exec.notify_on_exit,
            session_key: ctx.session_key.clone(),
        };
        Ok(settle(session, mode, &notice).await)
    }

    /// Environment the analyzer resolves executables against. On the gateway
    /// this is the environment the shell will actually see, `PATH` included.
    fn analysis_env(
        &self,
        request_env: &HashMap<String, String>,
        host: ExecHost,
    ) -> Result<HashMap<String, String>> {
        let mut env = request_env.clone();
        if host == ExecHost::Gateway {
            validate_host_env(&env)?;
            if let Some(path) = gateway::effective_path(&self.config.exec().path_prepend)? {
                env.insert("PATH".to_string(), path);
            }
        }
        Ok(env)
    }

    /// The directory the command runs in. Gateway directories must exist;
    /// sandbox directories are mapped into the container and node
    /// directories are the node's business.
    fn resolve_workdir(&self, requested: Option<&Path>, host: ExecHost) -> Result<PathBuf> {
        let requested = requested
            .map(|p| expand_home(&p.to_string_lossy()))
            .filter(|p| !p.as_os_str().is_empty());

        let workdir = match (requested, host) {
            (Some(path), ExecHost::Node) => return Ok(path),
            (None, ExecHost::Node) => return Ok(PathBuf::new()),
            (Some(path), _) => path,
            (None, ExecHost::Sandbox) => match self
                .config
                .exec()
                .sandbox
                .as_ref()
                .and_then(|s| s.workspace_dir.clone())
            {
                Some(dir) => dir,
                None => current_dir()?,
            },
            (None, ExecHost::Gateway) => current_dir()?,
        };

        let workdir = if workdir.is_relative() {
            current_dir()?.join(workdir)
        } else {
            workdir
        };
        if host == ExecHost::Gateway && !workdir.is_dir() {
            return Err(ExecError::InvalidWorkdir(workdir));
        }
        Ok(workdir)
    }
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir()
        .map_err(|e| ExecError::InvalidRequest(format!("cannot determine working directory: {e}")))
}
