//! Exec security: command analysis, policy resolution, the durable
//! allowlist and the approval workflow.

pub mod allowlist_store;
pub mod analyzer;
pub mod approval;
pub mod env_guard;
pub mod path_resolver;
pub mod policy;
pub mod serial_queue;
pub mod shell_parser;

pub use allowlist_store::AllowlistStore;
pub use analyzer::{analyze, literal_command};
pub use approval::{
    ApprovalResolution, ApprovalWorkflow, PendingExec, requires_approval, resolve_decision,
};
pub use env_guard::{is_dangerous_env_key, validate_host_env};
pub use path_resolver::{CommandResolution, OsFamily, Platform};
pub use policy::{PolicyResolver, fold_node_policy};
pub use serial_queue::SerialQueue;
