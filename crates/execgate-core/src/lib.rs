//! ExecGate Core - the policy gate in front of agent shell commands.
//!
//! A request flows through:
//! - [`security::policy`]: fold config, approvals and request scopes into an
//!   effective policy (host, security, ask, fallback, allowlist)
//! - [`security::analyzer`]: split the command, resolve each executable and
//!   match it against the allowlist and safe bins
//! - [`security::approval`]: ask a human when the policy requires it
//! - [`dispatch`]: run on the sandbox, gateway or a paired node
//! - [`process`]: return the result, or hand the session to the registry
//!   once the yield window elapses
//!
//! [`runtime::ExecRunner`] wires these together.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod process;
pub mod runtime;
pub mod security;

pub use config::ExecGateConfig;
pub use error::{ExecError, Result, SanitizeError, StoreError};
pub use models::*;
pub use runtime::ExecRunner;
