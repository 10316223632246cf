//! Process registry contract for backgrounded sessions.

use std::sync::Arc;

/// Read/kill access to a running or finished execution session.
pub trait SessionHandle: Send + Sync {
    fn session_id(&self) -> &str;
    fn command(&self) -> &str;
    fn pid(&self) -> Option<u32>;
    fn cwd(&self) -> &str;
    fn started_at(&self) -> i64;
    /// Last `max_chars` characters of the aggregated output.
    fn tail(&self, max_chars: usize) -> String;
    /// `None` while the process is still running.
    fn exit_code(&self) -> Option<Option<i32>>;
    fn kill(&self);
}

/// Long-lived owner of backgrounded sessions.
pub trait ProcessRegistry: Send + Sync {
    /// Hands lifetime ownership of `session` to the registry.
    fn mark_backgrounded(&self, session: Arc<dyn SessionHandle>);

    fn tail(&self, session_id: &str, max_chars: usize) -> Option<String>;
}
