use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use chrono::Utc;
use execgate_traits::{ExecHost, SessionHandle};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::output::OutputBuffer;

const RUNNING: u8 = 0;
const BACKGROUNDED: u8 = 1;
const SETTLED: u8 = 2;

/// Ownership phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Owned by the original tool call.
    Running,
    /// Handed off to the process registry. Final.
    Backgrounded,
    /// Result claimed by the original tool call. Final.
    Settled,
}

/// How a session's process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub killed: bool,
    /// Spawn / transport failure.
    pub error: Option<String>,
}

impl SessionExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none() && !self.timed_out && !self.killed
    }

    /// Short reason for a failed run.
    pub fn failure_reason(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        if self.timed_out {
            return Some(format!("Timed out after {} ms", self.duration_ms));
        }
        if self.killed {
            return Some("Killed".to_string());
        }
        Some(match self.exit_code {
            Some(code) => format!("Exited with code {code}"),
            None => "Exited without a status code".to_string(),
        })
    }
}

/// One dispatched command.
pub struct ExecutionSession {
    id: String,
    command: String,
    cwd: String,
    host: ExecHost,
    started_at: i64,
    started: Instant,
    pid: Mutex<Option<u32>>,
    output: Mutex<OutputBuffer>,
    phase: AtomicU8,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<SessionExit>>,
}

impl std::fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("cwd", &self.cwd)
            .field("host", &self.host)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl ExecutionSession {
    pub fn new(
        command: impl Into<String>,
        cwd: impl Into<String>,
        host: ExecHost,
        max_output_chars: usize,
    ) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            cwd: cwd.into(),
            host,
            started_at: Utc::now().timestamp_millis(),
            started: Instant::now(),
            pid: Mutex::new(None),
            output: Mutex::new(OutputBuffer::new(max_output_chars)),
            phase: AtomicU8::new(RUNNING),
            kill: CancellationToken::new(),
            exit_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> ExecHost {
        self.host
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock() = pid;
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn append_output(&self, data: &str) {
        self.output.lock().push(data);
    }

    /// Aggregated output and whether it was truncated.
    pub fn output(&self) -> (String, bool) {
        let output = self.output.lock();
        (output.text().to_string(), output.truncated())
    }

    pub fn phase(&self) -> SessionPhase {
        match self.phase.load(Ordering::Acquire) {
            RUNNING => SessionPhase::Running,
            BACKGROUNDED => SessionPhase::Backgrounded,
            _ => SessionPhase::Settled,
        }
    }

    pub fn is_backgrounded(&self) -> bool {
        self.phase() == SessionPhase::Backgrounded
    }

    /// `running → backgrounded`. Returns `false` if the foreground already
    /// claimed the session.
    pub fn try_background(&self) -> bool {
        self.phase
            .compare_exchange(RUNNING, BACKGROUNDED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `running → settled`. Returns `false` only if the session was
    /// backgrounded first.
    pub fn claim_foreground(&self) -> bool {
        match self
            .phase
            .compare_exchange(RUNNING, SETTLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == SETTLED,
        }
    }

    /// Signalled by [`SessionHandle::kill`]; the driver always honors it.
    pub fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }

    /// Records the exit. Only the first call has any effect.
    pub fn finish(&self, exit: SessionExit) {
        self.exit_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(exit);
            true
        });
    }

    pub fn exit(&self) -> Option<SessionExit> {
        self.exit_tx.borrow().clone()
    }

    /// Resolves once the process has ended.
    pub async fn wait(&self) -> SessionExit {
        let mut rx = self.exit_tx.subscribe();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            // The sender lives in `self`, so this only fails if it is dropped.
            if rx.changed().await.is_err() {
                return self.exit().unwrap_or(SessionExit {
                    exit_code: None,
                    duration_ms: self.elapsed_ms(),
                    timed_out: false,
                    killed: true,
                    error: Some("Session dropped".to_string()),
                });
            }
        }
    }
}

impl SessionHandle for ExecutionSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    fn cwd(&self) -> &str {
        &self.cwd
    }

    fn started_at(&self) -> i64 {
        self.started_at
    }

    fn tail(&self, max_chars: usize) -> String {
        self.output.lock().tail(max_chars)
    }

    fn exit_code(&self) -> Option<Option<i32>> {
        self.exit().map(|exit| exit.exit_code)
    }

    fn kill(&self) {
        self.kill.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session() -> Arc<ExecutionSession> {
        Arc::new(ExecutionSession::new("sleep 1", "/tmp", ExecHost::Gateway, 1000))
    }

    #[test]
    fn test_background_is_one_way() {
        let session = session();
        assert!(session.try_background());
        assert!(!session.try_background());
        assert!(!session.claim_foreground());
        assert_eq!(session.phase(), SessionPhase::Backgrounded);
    }

    #[test]
    fn test_settled_session_cannot_background() {
        let session = session();
        assert!(session.claim_foreground());
        assert!(session.claim_foreground());
        assert!(!session.try_background());
        assert_eq!(session.phase(), SessionPhase::Settled);
    }

    #[test]
    fn test_concurrent_race_has_single_winner() {
        for _ in 0..200 {
            let session = session();
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let yielder = {
                let session = session.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    session.try_background()
                })
            };
            let completer = {
                let session = session.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    session.claim_foreground()
                })
            };
            let backgrounded = yielder.join().unwrap();
            let completed = completer.join().unwrap();
            assert!(backgrounded ^ completed);
        }
    }

    #[tokio::test]
    async fn test_finish_is_first_write_wins() {
        let session = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait().await })
        };
        session.finish(SessionExit {
            exit_code: Some(0),
            duration_ms: 5,
            timed_out: false,
            killed: false,
            error: None,
        });
        session.finish(SessionExit {
            exit_code: Some(1),
            duration_ms: 6,
            timed_out: false,
            killed: false,
            error: None,
        });
        let exit = waiter.await.unwrap();
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(session.exit_code(), Some(Some(0)));
        assert!(exit.success());
    }

    #[test]
    fn test_failure_reasons() {
        let exit = SessionExit {
            exit_code: Some(2),
            duration_ms: 1,
            timed_out: false,
            killed: false,
            error: None,
        };
        assert_eq!(exit.failure_reason().unwrap(), "Exited with code 2");
        let timed_out = SessionExit {
            exit_code: None,
            timed_out: true,
            ..exit.clone()
        };
        assert!(timed_out.failure_reason().unwrap().contains("Timed out"));
    }

    #[test]
    fn test_kill_cancels_token() {
        let session = session();
        SessionHandle::kill(session.as_ref());
        assert!(session.kill_token().is_cancelled());
    }
}
