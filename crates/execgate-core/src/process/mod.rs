//! Execution sessions and the registry that owns backgrounded ones.

mod lifecycle;
mod session;

pub use lifecycle::{BackgroundNotice, YieldMode, clamp_yield, settle};
pub(crate) use lifecycle::finished_event;
pub use session::{ExecutionSession, SessionExit, SessionPhase};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use execgate_traits::{ProcessRegistry, SessionHandle};
use serde::Serialize;

const DEFAULT_TTL_SECONDS: u64 = 30 * 60;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const FINISHED_TAIL_CHARS: usize = 20_000;

/// Snapshot kept after a backgrounded session exits.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedSession {
    pub session_id: String,
    pub command: String,
    pub cwd: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub exit_code: Option<i32>,
    pub tail: String,
}

/// Listing entry for running and finished sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub command: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub started_at: i64,
    pub status: &'static str,
    pub exit_code: Option<i32>,
}

/// In-process [`ProcessRegistry`]. Exited sessions are moved to a finished
/// table and dropped after a TTL.
#[derive(Clone)]
pub struct InMemoryProcessRegistry {
    sessions: Arc<DashMap<String, Arc<dyn SessionHandle>>>,
    finished: Arc<DashMap<String, FinishedSession>>,
    ttl: Duration,
}

impl Default for InMemoryProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProcessRegistry {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(DEFAULT_TTL_SECONDS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let registry = Self {
            sessions: Arc::new(DashMap::new()),
            finished: Arc::new(DashMap::new()),
            ttl,
        };
        registry.spawn_cleanup_task();
        registry
    }

    fn spawn_cleanup_task(&self) {
        let registry = self.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                loop {
                    tokio::time::sleep(SWEEP_INTERVAL).await;
                    registry.sweep();
                }
            });
        } else {
            tracing::warn!("No Tokio runtime found for process cleanup task");
        }
    }

    /// Moves exited sessions to the finished table and drops finished
    /// entries older than the TTL.
    pub fn sweep(&self) {
        let now = Utc::now().timestamp_millis();
        let exited: Vec<Arc<dyn SessionHandle>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().exit_code().is_some())
            .map(|entry| entry.value().clone())
            .collect();
        for session in exited {
            self.sessions.remove(session.session_id());
            self.finished.insert(
                session.session_id().to_string(),
                FinishedSession {
                    session_id: session.session_id().to_string(),
                    command: session.command().to_string(),
                    cwd: session.cwd().to_string(),
                    started_at: session.started_at(),
                    finished_at: now,
                    exit_code: session.exit_code().flatten(),
                    tail: session.tail(FINISHED_TAIL_CHARS),
                },
            );
        }

        let ttl_ms = self.ttl.as_millis() as i64;
        self.finished
            .retain(|_, finished| now.saturating_sub(finished.finished_at) <= ttl_ms);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<dyn SessionHandle>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn finished(&self, session_id: &str) -> Option<FinishedSession> {
        self.finished.get(session_id).map(|f| f.value().clone())
    }

    pub fn kill(&self, session_id: &str) -> anyhow::Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| anyhow::anyhow!("Session not found: {}", session_id))?;
        session.kill();
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut items: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                let exit_code = session.exit_code();
                SessionInfo {
                    session_id: session.session_id().to_string(),
                    command: session.command().to_string(),
                    cwd: session.cwd().to_string(),
                    pid: session.pid(),
                    started_at: session.started_at(),
                    status: session_status(exit_code),
                    exit_code: exit_code.flatten(),
                }
            })
            .collect();

        for entry in self.finished.iter() {
            items.push(SessionInfo {
                session_id: entry.session_id.clone(),
                command: entry.command.clone(),
                cwd: entry.cwd.clone(),
                pid: None,
                started_at: entry.started_at,
                status: session_status(Some(entry.exit_code)),
                exit_code: entry.exit_code,
            });
        }
        items.sort_by_key(|item| item.started_at);
        items
    }
}

impl ProcessRegistry for InMemoryProcessRegistry {
    fn mark_backgrounded(&self, session: Arc<dyn SessionHandle>) {
        tracing::debug!(session_id = %session.session_id(), "Session backgrounded");
        self.sessions
            .insert(session.session_id().to_string(), session);
    }

    fn tail(&self, session_id: &str, max_chars: usize) -> Option<String> {
        if let Some(session) = self.sessions.get(session_id) {
            return Some(session.tail(max_chars));
        }
        self.finished
            .get(session_id)
            .map(|f| crate::dispatch::output::tail_chars(&f.tail, max_chars))
    }
}

fn session_status(exit_code: Option<Option<i32>>) -> &'static str {
    match exit_code {
        None => "running",
        Some(Some(0)) => "completed",
        Some(_) => "failed",
    }
}
