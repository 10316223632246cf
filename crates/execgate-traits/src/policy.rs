//! Closed policy enumerations shared by every ExecGate crate.
//!
//! `ExecSecurity` and `ExecAsk` carry a total order given by their variant
//! order. Every merge in the workspace goes through [`min_security`] and
//! [`max_ask`] so that composing two fragments can never loosen policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecHost {
    /// Restricted container on the local machine.
    #[default]
    Sandbox,
    /// The local privileged host running the gateway.
    Gateway,
    /// A remote paired companion node.
    Node,
}

/// How much a host is allowed to run. Ordered `Deny < Allowlist < Full`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ExecSecurity {
    #[default]
    Deny,
    Allowlist,
    Full,
}

/// When a human is asked. Ordered `Off < OnMiss < Always`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum ExecAsk {
    Off,
    #[default]
    OnMiss,
    Always,
}

/// The more restrictive of two security levels.
pub fn min_security(a: ExecSecurity, b: ExecSecurity) -> ExecSecurity {
    a.min(b)
}

/// The more demanding of two ask modes.
pub fn max_ask(a: ExecAsk, b: ExecAsk) -> ExecAsk {
    a.max(b)
}

impl ExecHost {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Gateway => "gateway",
            Self::Node => "node",
        }
    }
}

impl ExecSecurity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Allowlist => "allowlist",
            Self::Full => "full",
        }
    }
}

impl ExecAsk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::OnMiss => "on-miss",
            Self::Always => "always",
        }
    }
}

impl fmt::Display for ExecHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ExecSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ExecAsk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecHost {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "gateway" => Ok(Self::Gateway),
            "node" => Ok(Self::Node),
            other => Err(format!("unknown exec host: {other}")),
        }
    }
}

impl FromStr for ExecSecurity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" => Ok(Self::Deny),
            "allowlist" => Ok(Self::Allowlist),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown exec security: {other}")),
        }
    }
}

impl FromStr for ExecAsk {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "on-miss" | "on_miss" => Ok(Self::OnMiss),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown exec ask mode: {other}")),
        }
    }
}
