//! Exec tool input.

use std::collections::HashMap;
use std::path::PathBuf;

use execgate_traits::{ExecAsk, ExecHost, ExecSecurity};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A request to run one shell command. Immutable once accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub pty: bool,
    #[serde(default)]
    pub background: bool,
    /// Milliseconds to wait before handing the session to the background.
    #[serde(default)]
    pub yield_ms: Option<u64>,
    #[serde(default)]
    pub elevated: bool,
    #[serde(default)]
    pub host: Option<ExecHost>,
    #[serde(default)]
    pub security: Option<ExecSecurity>,
    #[serde(default)]
    pub ask: Option<ExecAsk>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn with_yield_ms(mut self, ms: u64) -> Self {
        self.yield_ms = Some(ms);
        self
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn with_host(mut self, host: ExecHost) -> Self {
        self.host = Some(host);
        self
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

/// Who is asking, and the handle that cancels the originating tool call.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub agent_id: String,
    pub session_key: String,
    /// Message provider the request arrived through, e.g. `telegram`.
    pub provider: Option<String>,
    pub sender: Option<String>,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn new(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            session_key: agent_id.clone(),
            agent_id,
            provider: None,
            sender: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = key.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>, sender: Option<String>) -> Self {
        self.provider = Some(provider.into());
        self.sender = sender;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_tool_json() {
        let request: ExecRequest = serde_json::from_value(serde_json::json!({
            "command": "ls -la",
            "workdir": "/tmp",
            "background": true,
            "ask": "always",
            "host": "gateway"
        }))
        .unwrap();
        assert_eq!(request.command, "ls -la");
        assert!(request.background);
        assert_eq!(request.ask, Some(ExecAsk::Always));
        assert_eq!(request.host, Some(ExecHost::Gateway));
        assert!(request.env.is_empty());
        assert!(!request.elevated);
    }
}
