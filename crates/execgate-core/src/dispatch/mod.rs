//! Execution host dispatch.
//!
//! [`HostDispatcher`] turns an approved request into a running
//! [`ExecutionSession`] on one of three hosts:
//! - **sandbox**: `docker exec` into the configured container
//! - **gateway**: `/bin/sh -c` on the local host, optionally under a PTY
//! - **node**: `system.run` on a paired node through [`NodeRpc`]
//!
//! Every host finishes the session exactly once, kills on timeout or
//! explicit kill, and honors caller cancellation only while the session is
//! still in the foreground.

pub mod gateway;
pub mod local;
pub mod node;
pub mod output;
pub mod pty;
pub mod sandbox;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use execgate_traits::{ApprovalDecision, ExecHost, NodeInfo, NodeRpc};
use tokio_util::sync::CancellationToken;

use crate::config::ExecToolConfig;
use crate::error::{ExecError, Result};
use crate::process::ExecutionSession;
use crate::security::env_guard::validate_host_env;

pub use local::LocalCommand;
pub use output::OutputBuffer;

/// An approved command ready to run.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Command as the agent wrote it.
    pub command: String,
    /// Literal-argument rendering to run instead of `command`.
    pub sanitized_command: Option<String>,
    pub workdir: PathBuf,
    pub env: HashMap<String, String>,
    pub host: ExecHost,
    pub pty: bool,
    pub timeout: Duration,
    /// Target node; required for `host=node`.
    pub node: Option<NodeInfo>,
    /// Set when a human (or the fallback) approved this run.
    pub approval: Option<ApprovalDecision>,
}

impl DispatchRequest {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>, host: ExecHost) -> Self {
        Self {
            command: command.into(),
            sanitized_command: None,
            workdir: workdir.into(),
            env: HashMap::new(),
            host,
            pty: false,
            timeout: Duration::from_secs(1800),
            node: None,
            approval: None,
        }
    }

    /// The command line that is actually executed.
    pub fn effective_command(&self) -> &str {
        self.sanitized_command.as_deref().unwrap_or(&self.command)
    }
}

pub struct HostDispatcher {
    config: ExecToolConfig,
    nodes: Option<Arc<dyn NodeRpc>>,
}

impl HostDispatcher {
    pub fn new(config: ExecToolConfig) -> Self {
        Self {
            config,
            nodes: None,
        }
    }

    pub fn with_nodes(mut self, nodes: Arc<dyn NodeRpc>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn config(&self) -> &ExecToolConfig {
        &self.config
    }

    pub fn nodes(&self) -> Option<Arc<dyn NodeRpc>> {
        self.nodes.clone()
    }

    /// Starts `request` and returns its session. Must be called from within
    /// a Tokio runtime.
    pub fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<Arc<ExecutionSession>> {
        let command = request.effective_command().to_string();
        let max_output = self.config.max_output_chars;

        let session = match request.host {
            ExecHost::Sandbox => {
                let (spec, container_dir) = sandbox::build_command(
                    self.config.sandbox.as_ref(),
                    &command,
                    &request.workdir,
                    &request.env,
                )?;
                let session = Arc::new(ExecutionSession::new(
                    &request.command,
                    container_dir,
                    ExecHost::Sandbox,
                    max_output,
                ));
                local::spawn_piped(spec, session.clone(), request.timeout, cancel)?;
                session
            }
            ExecHost::Gateway => {
                if !request.workdir.is_dir() {
                    return Err(ExecError::InvalidWorkdir(request.workdir.clone()));
                }
                let spec = gateway::build_command(
                    &command,
                    &request.workdir,
                    &request.env,
                    &self.config.path_prepend,
                )?;
                let session = Arc::new(ExecutionSession::new(
                    &request.command,
                    request.workdir.to_string_lossy(),
                    ExecHost::Gateway,
                    max_output,
                ));
                if request.pty && self.config.pty {
                    pty::spawn_pty(spec, session.clone(), request.timeout, cancel)?;
                } else {
                    local::spawn_piped(spec, session.clone(), request.timeout, cancel)?;
                }
                session
            }
            ExecHost::Node => {
                let rpc = self.nodes.clone().ok_or_else(|| {
                    ExecError::NodeUnavailable("no node transport configured".to_string())
                })?;
                let node = request.node.clone().ok_or_else(|| {
                    ExecError::NodeUnavailable("no node selected for host=node".to_string())
                })?;
                validate_host_env(&request.env)?;
                let cwd = (!request.workdir.as_os_str().is_empty())
                    .then(|| request.workdir.to_string_lossy().into_owned());
                let session = Arc::new(ExecutionSession::new(
                    &request.command,
                    cwd.clone().unwrap_or_default(),
                    ExecHost::Node,
                    max_output,
                ));
                node::spawn_node_run(
                    rpc,
                    node::NodeRun {
                        node,
                        command,
                        raw_command: request.command.clone(),
                        cwd,
                        env: request.env.clone(),
                        timeout: request.timeout,
                        approval: request.approval,
                    },
                    session.clone(),
                    cancel,
                );
                session
            }
        };

        tracing::info!(
            session_id = %session.id(),
            host = %request.host,
            sanitized = request.sanitized_command.is_some(),
            approved = request.approval.is_some(),
            "Dispatched exec"
        );
        Ok(session)
    }
}
