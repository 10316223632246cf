//! Request entry point.

mod exec;
mod sinks;

pub use exec::{ExecRunner, ExecRunnerBuilder, MAX_TIMEOUT_SECS};
pub use sinks::{LogEventSink, UnavailableApprover};
