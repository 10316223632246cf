//! Policy fragments and the effective policy they fold into.

use std::collections::BTreeSet;

use execgate_traits::{ExecAsk, ExecHost, ExecSecurity};
use serde::{Deserialize, Serialize};

/// Executables considered safe when they only read stdin.
pub const DEFAULT_SAFE_BINS: &[&str] = &[
    "jq", "grep", "cut", "sort", "uniq", "head", "tail", "tr", "wc",
];

/// One scope's contribution to the exec policy. Every field is optional;
/// an unset field does not take part in the merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFragment {
    /// Human-readable scope name used in logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<ExecHost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<ExecSecurity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<ExecAsk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_fallback: Option<ExecSecurity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_bins: Option<Vec<String>>,
}

impl PolicyFragment {
    pub fn named(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: ExecHost) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_security(mut self, security: ExecSecurity) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_ask(mut self, ask: ExecAsk) -> Self {
        self.ask = Some(ask);
        self
    }

    pub fn with_ask_fallback(mut self, fallback: ExecSecurity) -> Self {
        self.ask_fallback = Some(fallback);
        self
    }

    pub fn with_allowlist<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowlist.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn with_safe_bins<I, S>(mut self, bins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.safe_bins = Some(bins.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_none()
            && self.security.is_none()
            && self.ask.is_none()
            && self.ask_fallback.is_none()
            && self.allowlist.is_empty()
            && self.safe_bins.is_none()
    }
}

/// Fully determined policy for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub host: ExecHost,
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    pub ask_fallback: ExecSecurity,
    pub allowlist: Vec<String>,
    pub safe_bins: BTreeSet<String>,
    /// Set when the elevated path was granted for this request.
    #[serde(default)]
    pub elevated: Option<ElevatedLevel>,
}

impl EffectivePolicy {
    pub fn is_elevated_bypass(&self) -> bool {
        matches!(self.elevated, Some(ElevatedLevel::Full))
    }
}

/// How far a granted elevation reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElevatedLevel {
    /// Run on the privileged host with normal approvals.
    #[default]
    On,
    /// Run on the privileged host with `security=full` and `ask=off`.
    Full,
}

pub fn default_safe_bins() -> BTreeSet<String> {
    DEFAULT_SAFE_BINS.iter().map(|s| s.to_string()).collect()
}
