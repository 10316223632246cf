//! Remote companion nodes reached through [`NodeRpc`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use execgate_traits::node::{APPROVALS_GET, SYSTEM_RUN};
use execgate_traits::{ApprovalDecision, NodeInfo, NodeRpc, SystemRunParams, SystemRunResult};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ExecError, Result};
use crate::models::ApprovalsFile;
use crate::process::{ExecutionSession, SessionExit};
use crate::security::path_resolver::{OsFamily, Platform};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const APPROVALS_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);
const INVOKE_SLACK: Duration = Duration::from_secs(5);

/// Picks the node to run on. An explicit id (or display name) wins over the
/// configured default; with neither, a single eligible node is used.
pub async fn select_node(
    rpc: &dyn NodeRpc,
    requested: Option<&str>,
    default_node: Option<&str>,
) -> Result<NodeInfo> {
    let nodes = tokio::time::timeout(LIST_TIMEOUT, rpc.list_nodes())
        .await
        .map_err(|_| {
            ExecError::NodeUnavailable(format!(
                "node list did not answer within {} ms",
                LIST_TIMEOUT.as_millis()
            ))
        })?
        .map_err(|e| ExecError::NodeUnavailable(format!("failed to list nodes: {e}")))?;
    let eligible: Vec<&NodeInfo> = nodes
        .iter()
        .filter(|n| n.connected && n.supports(SYSTEM_RUN))
        .collect();

    let wanted = requested
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or(default_node.map(str::trim).filter(|s| !s.is_empty()));

    let Some(wanted) = wanted else {
        return match eligible.as_slice() {
            [node] => Ok((*node).clone()),
            [] => Err(ExecError::NodeUnavailable(
                "no connected node supports system.run".to_string(),
            )),
            _ => Err(ExecError::NodeUnavailable(
                "multiple nodes available; set tools.exec.node or pass node".to_string(),
            )),
        };
    };

    let node = nodes
        .iter()
        .find(|n| n.node_id == wanted || n.display_name.as_deref() == Some(wanted))
        .ok_or_else(|| ExecError::NodeUnavailable(format!("unknown node '{wanted}'")))?;
    if !node.connected {
        return Err(ExecError::NodeUnavailable(format!(
            "node '{wanted}' is not connected"
        )));
    }
    if !node.supports(SYSTEM_RUN) {
        return Err(ExecError::NodeUnavailable(format!(
            "node '{wanted}' does not support {SYSTEM_RUN}"
        )));
    }
    Ok(node.clone())
}

/// `{file, hash?}`; the hash is not needed here.
#[derive(Debug, Deserialize)]
struct ApprovalsSnapshot {
    file: ApprovalsFile,
}

/// Fetches the node's approvals file. Any failure yields an empty file, so
/// the node path falls back to an empty allowlist.
pub async fn fetch_node_approvals(rpc: &dyn NodeRpc, node: &NodeInfo) -> ApprovalsFile {
    let call = rpc.invoke(
        &node.node_id,
        APPROVALS_GET,
        serde_json::json!({}),
        APPROVALS_TIMEOUT,
    );
    let value = match tokio::time::timeout(APPROVALS_TIMEOUT, call).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            tracing::warn!(node = %node.node_id, error = %e, "Failed to fetch node approvals");
            return ApprovalsFile::default();
        }
        Err(_) => {
            tracing::warn!(node = %node.node_id, "Node approvals request timed out");
            return ApprovalsFile::default();
        }
    };
    match serde_json::from_value::<ApprovalsSnapshot>(value) {
        Ok(snapshot) => snapshot.file,
        Err(e) => {
            tracing::warn!(node = %node.node_id, error = %e, "Invalid node approvals snapshot");
            ApprovalsFile::default()
        }
    }
}

pub fn node_platform(node: &NodeInfo) -> Platform {
    Platform::remote(node.platform.as_deref())
}

pub fn node_argv(platform: Platform, command: &str) -> Vec<String> {
    match platform.family {
        OsFamily::Windows => vec![
            "cmd.exe".into(),
            "/d".into(),
            "/s".into(),
            "/c".into(),
            command.to_string(),
        ],
        OsFamily::Unix => vec!["/bin/sh".into(), "-lc".into(), command.to_string()],
    }
}

/// Transport timeout for a run with the given command timeout.
pub fn invoke_timeout(run_timeout: Duration) -> Duration {
    run_timeout
        .saturating_add(INVOKE_SLACK)
        .max(MIN_INVOKE_TIMEOUT)
}

pub struct NodeRun {
    pub node: NodeInfo,
    pub command: String,
    pub raw_command: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub approval: Option<ApprovalDecision>,
}

/// Starts `system.run` on a background task. Killing the session, or
/// cancelling it while foreground, abandons the call.
pub fn spawn_node_run(
    rpc: Arc<dyn NodeRpc>,
    run: NodeRun,
    session: Arc<ExecutionSession>,
    cancel: CancellationToken,
) {
    let params = SystemRunParams {
        argv: node_argv(node_platform(&run.node), &run.command),
        raw_command: run.raw_command,
        cwd: run.cwd,
        env: run.env,
        timeout_ms: u64::try_from(run.timeout.as_millis()).unwrap_or(u64::MAX),
        approved: run.approval.is_some(),
        approval_decision: run.approval.map(|d| d.as_str().to_string()),
        run_id: Uuid::new_v4().to_string(),
    };
    let node_id = run.node.node_id;
    let transport_timeout = invoke_timeout(run.timeout);

    tokio::spawn(async move {
        let params = match serde_json::to_value(&params) {
            Ok(params) => params,
            Err(e) => {
                session.finish(failure(&session, format!("invalid system.run params: {e}")));
                return;
            }
        };
        tracing::debug!(node = %node_id, session_id = %session.id(), "Invoking system.run");
        let call = tokio::time::timeout(
            transport_timeout,
            rpc.invoke(&node_id, SYSTEM_RUN, params, transport_timeout),
        );
        tokio::pin!(call);
        let mut watch_cancel = true;

        let exit = loop {
            tokio::select! {
                result = &mut call => break match result {
                    Ok(result) => completion(&session, result),
                    Err(_) => transport_timed_out(&session, transport_timeout),
                },
                _ = session.kill_token().cancelled() => break killed(&session),
                _ = cancel.cancelled(), if watch_cancel => {
                    if session.claim_foreground() {
                        break killed(&session);
                    }
                    watch_cancel = false;
                }
            }
        };
        session.finish(exit);
    });
}

fn completion(session: &ExecutionSession, result: anyhow::Result<serde_json::Value>) -> SessionExit {
    let value = match result {
        Ok(value) => value,
        Err(e) => return failure(session, format!("node invoke failed: {e}")),
    };
    let result: SystemRunResult = match serde_json::from_value(value) {
        Ok(result) => result,
        Err(e) => return failure(session, format!("invalid system.run result: {e}")),
    };
    if !result.stdout.is_empty() {
        session.append_output(&result.stdout);
    }
    if !result.stderr.is_empty() {
        session.append_output(&result.stderr);
    }
    let exit_code = result.exit_code.or(if result.success { Some(0) } else { None });
    SessionExit {
        exit_code,
        duration_ms: session.elapsed_ms(),
        timed_out: false,
        killed: false,
        error: if result.success { None } else { result.error },
    }
}

fn transport_timed_out(session: &ExecutionSession, limit: Duration) -> SessionExit {
    SessionExit {
        exit_code: None,
        duration_ms: session.elapsed_ms(),
        timed_out: true,
        killed: false,
        error: Some(format!(
            "node did not answer {SYSTEM_RUN} within {} ms",
            limit.as_millis()
        )),
    }
}

fn failure(session: &ExecutionSession, error: String) -> SessionExit {
    SessionExit {
        exit_code: None,
        duration_ms: session.elapsed_ms(),
        timed_out: false,
        killed: false,
        error: Some(error),
    }
}

fn killed(session: &ExecutionSession) -> SessionExit {
    SessionExit {
        exit_code: None,
        duration_ms: session.elapsed_ms(),
        timed_out: false,
        killed: true,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use execgate_traits::ExecHost;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    struct FakeNodes {
        nodes: Vec<NodeInfo>,
        approvals: Option<Value>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl NodeRpc for FakeNodes {
        async fn list_nodes(&self) -> anyhow::Result<Vec<NodeInfo>> {
            Ok(self.nodes.clone())
        }

        async fn invoke(
            &self,
            _node_id: &str,
            method: &str,
            params: Value,
            _timeout: Duration,
        ) -> anyhow::Result<Value> {
            self.calls.lock().push((method.to_string(), params));
            match method {
                APPROVALS_GET => self
                    .approvals
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("not paired")),
                _ => Ok(json!({"success": true, "exitCode": 0, "stdout": "ok\n"})),
            }
        }
    }

    fn node(id: &str, connected: bool, platform: &str) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            display_name: Some(format!("{id}-name")),
            platform: Some(platform.to_string()),
            connected,
            commands: vec![SYSTEM_RUN.to_string()],
        }
    }

    fn fake(nodes: Vec<NodeInfo>) -> FakeNodes {
        FakeNodes {
            nodes,
            approvals: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_select_single_eligible_node() {
        let rpc = fake(vec![node("a", true, "linux"), node("b", false, "linux")]);
        let selected = select_node(&rpc, None, None).await.unwrap();
        assert_eq!(selected.node_id, "a");
    }

    #[tokio::test]
    async fn test_select_by_display_name_and_default() {
        let rpc = fake(vec![node("a", true, "linux"), node("b", true, "darwin")]);
        assert_eq!(select_node(&rpc, Some("b-name"), None).await.unwrap().node_id, "b");
        assert_eq!(select_node(&rpc, None, Some("a")).await.unwrap().node_id, "a");
        assert!(matches!(
            select_node(&rpc, None, None).await,
            Err(ExecError::NodeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_select_rejects_disconnected_or_unsupported() {
        let mut no_run = node("c", true, "linux");
        no_run.commands.clear();
        let rpc = fake(vec![node("b", false, "linux"), no_run]);
        assert!(select_node(&rpc, Some("b"), None).await.is_err());
        assert!(select_node(&rpc, Some("c"), None).await.is_err());
        assert!(select_node(&rpc, Some("zzz"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_approvals_failure_is_empty_file() {
        let rpc = fake(vec![node("a", true, "linux")]);
        let file = fetch_node_approvals(&rpc, &rpc.nodes[0]).await;
        assert!(file.agents.is_empty());
    }

    #[tokio::test]
    async fn test_approvals_snapshot_parsed() {
        let mut rpc = fake(vec![node("a", true, "linux")]);
        rpc.approvals = Some(json!({
            "file": {"version": 1, "agents": {"main": {"allowlist": [
                {"id": "1", "pattern": "/usr/bin/make"}
            ]}}},
            "hash": "abc"
        }));
        let file = fetch_node_approvals(&rpc, &rpc.nodes[0]).await;
        assert_eq!(file.patterns_for("main"), vec!["/usr/bin/make".to_string()]);
    }

    #[test]
    fn test_argv_per_platform() {
        assert_eq!(
            node_argv(Platform::remote(Some("win32")), "dir"),
            vec!["cmd.exe", "/d", "/s", "/c", "dir"]
        );
        assert_eq!(
            node_argv(Platform::remote(Some("darwin")), "ls"),
            vec!["/bin/sh", "-lc", "ls"]
        );
    }

    #[test]
    fn test_invoke_timeout_floor() {
        assert_eq!(invoke_timeout(Duration::from_secs(1)), Duration::from_secs(10));
        assert_eq!(invoke_timeout(Duration::from_secs(60)), Duration::from_secs(65));
    }

    #[test]
    fn test_invoke_timeout_saturates() {
        assert_eq!(invoke_timeout(Duration::from_secs(u64::MAX)), Duration::MAX);
        assert_eq!(invoke_timeout(Duration::MAX), Duration::MAX);
    }

    /// A transport that never answers.
    struct SilentNodes;

    #[async_trait]
    impl NodeRpc for SilentNodes {
        async fn list_nodes(&self) -> anyhow::Result<Vec<NodeInfo>> {
            std::future::pending().await
        }

        async fn invoke(
            &self,
            _node_id: &str,
            _method: &str,
            _params: Value,
            _timeout: Duration,
        ) -> anyhow::Result<Value> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_list_is_unavailable() {
        let err = select_node(&SilentNodes, Some("a"), None).await.unwrap_err();
        assert!(matches!(err, ExecError::NodeUnavailable(ref m) if m.contains("did not answer")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_approvals_fetch_is_empty_file() {
        let file = fetch_node_approvals(&SilentNodes, &node("a", true, "linux")).await;
        assert!(file.agents.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_system_run_finishes_timed_out() {
        let session = Arc::new(ExecutionSession::new("ls", "/", ExecHost::Node, 1000));
        spawn_node_run(
            Arc::new(SilentNodes),
            NodeRun {
                node: node("a", true, "linux"),
                command: "ls".into(),
                raw_command: "ls".into(),
                cwd: None,
                env: HashMap::new(),
                timeout: Duration::from_secs(1),
                approval: None,
            },
            session.clone(),
            CancellationToken::new(),
        );
        let exit = session.wait().await;
        assert!(exit.timed_out);
        assert!(!exit.success());
        assert!(exit.error.as_deref().unwrap().contains(SYSTEM_RUN));
    }

    #[tokio::test]
    async fn test_huge_timeout_is_reported_without_truncation() {
        let rpc = Arc::new(fake(vec![node("a", true, "linux")]));
        let session = Arc::new(ExecutionSession::new("ls", "/", ExecHost::Node, 1000));
        spawn_node_run(
            rpc.clone(),
            NodeRun {
                node: rpc.nodes[0].clone(),
                command: "ls".into(),
                raw_command: "ls".into(),
                cwd: None,
                env: HashMap::new(),
                timeout: Duration::MAX,
                approval: None,
            },
            session.clone(),
            CancellationToken::new(),
        );
        assert!(session.wait().await.success());
        let calls = rpc.calls.lock();
        assert_eq!(calls[0].1["timeoutMs"], json!(u64::MAX));
    }

    #[tokio::test]
    async fn test_system_run_params_and_output() {
        let rpc = Arc::new(fake(vec![node("a", true, "linux")]));
        let session = Arc::new(ExecutionSession::new("ls", "/", ExecHost::Node, 1000));
        spawn_node_run(
            rpc.clone(),
            NodeRun {
                node: rpc.nodes[0].clone(),
                command: "ls".into(),
                raw_command: "ls".into(),
                cwd: Some("/srv".into()),
                env: HashMap::new(),
                timeout: Duration::from_secs(30),
                approval: Some(ApprovalDecision::AllowOnce),
            },
            session.clone(),
            CancellationToken::new(),
        );
        let exit = session.wait().await;
        assert!(exit.success());
        assert_eq!(session.output().0, "ok\n");

        let calls = rpc.calls.lock();
        let (method, params) = &calls[0];
        assert_eq!(method, SYSTEM_RUN);
        assert_eq!(params["argv"], json!(["/bin/sh", "-lc", "ls"]));
        assert_eq!(params["approved"], json!(true));
        assert_eq!(params["approvalDecision"], json!("allow-once"));
        assert_eq!(params["timeoutMs"], json!(30_000));
        assert!(params["runId"].as_str().is_some());
    }
}
