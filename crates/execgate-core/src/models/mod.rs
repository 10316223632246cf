pub mod allowlist;
pub mod analysis;
pub mod approval;
pub mod outcome;
pub mod policy;
pub mod request;

pub use allowlist::{
    AgentApprovals, AllowlistEntry, ApprovalsDefaults, ApprovalsFile, WILDCARD_AGENT,
};
pub use analysis::{AllowlistMatch, CommandAnalysis, MatchSource, SegmentAnalysis};
pub use approval::{ApprovalRequest, ApprovalState};
pub use outcome::ExecOutcome;
pub use policy::{
    DEFAULT_SAFE_BINS, EffectivePolicy, ElevatedLevel, PolicyFragment, default_safe_bins,
};
pub use request::{ExecContext, ExecRequest};
