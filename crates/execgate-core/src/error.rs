//! Error types for the exec core

use std::path::PathBuf;

use execgate_traits::ExecHost;
use thiserror::Error;

/// Why a request was refused or could not be run.
///
/// Every variant renders as a short, human-readable reason.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("exec host not allowed (requested {requested}; configure tools.exec.host={requested} to allow)")]
    HostNotAllowed { requested: ExecHost },

    #[error("elevated exec is not available right now ({})", .failing.join("; "))]
    ElevatedUnavailable {
        /// Each failing gate with the config key that opens it.
        failing: Vec<String>,
    },

    #[error("exec denied: security=deny on host {0}")]
    SecurityDeny(ExecHost),

    #[error("exec denied: allowlist miss ({0})")]
    AllowlistMiss(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("workdir not found: {}", .0.display())]
    InvalidWorkdir(PathBuf),

    #[error("environment variable {0} is not allowed on the gateway host")]
    EnvRejected(String),

    #[error("exec denied: could not sanitize command ({0})")]
    SanitizeFailed(#[from] SanitizeError),

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("approvals store error: {0}")]
    Store(#[from] StoreError),
}

/// A command could not be re-rendered safely.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("command not analyzable: {0}")]
    Unanalyzable(String),

    #[error("{0}")]
    Ambiguous(String),

    #[error("argument contains a NUL byte")]
    NulByte,
}

/// Failures of the approvals file store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("update rejected: {0}")]
    Rejected(String),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Result type alias for exec operations
pub type Result<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_not_allowed_names_config_key() {
        let err = ExecError::HostNotAllowed {
            requested: ExecHost::Node,
        };
        assert_eq!(
            err.to_string(),
            "exec host not allowed (requested node; configure tools.exec.host=node to allow)"
        );
    }

    #[test]
    fn test_elevated_unavailable_lists_gates() {
        let err = ExecError::ElevatedUnavailable {
            failing: vec![
                "enabled (tools.elevated.enabled)".into(),
                "allowFrom (tools.elevated.allow_from.telegram)".into(),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("tools.elevated.enabled"));
        assert!(text.contains("tools.elevated.allow_from.telegram"));
    }
}
