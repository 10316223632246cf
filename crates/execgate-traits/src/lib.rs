//! ExecGate Traits - shared policy enums and collaborator contracts.
//!
//! This crate provides the interfaces the exec core talks to:
//! - `ExecHost`, `ExecSecurity`, `ExecAsk` and their total order
//! - `ApproverChannel`, `ApprovalPrompt`, `ApprovalDecision`
//! - `NodeRpc` and the `system.run` request/response shapes
//! - `EventSink` and `ExecEvent`
//! - `ProcessRegistry` and `SessionHandle`

pub mod approver;
pub mod events;
pub mod node;
pub mod policy;
pub mod process;

// ── Top-level re-exports ─────────────────────────────────────────────

pub use approver::{ApprovalDecision, ApprovalPrompt, ApproverChannel};
pub use events::{ApprovalSource, DenialReason, EventSink, ExecEvent};
pub use node::{NodeInfo, NodeRpc, SystemRunParams, SystemRunResult};
pub use policy::{ExecAsk, ExecHost, ExecSecurity, max_ask, min_security};
pub use process::{ProcessRegistry, SessionHandle};
