//! Piped child processes for the gateway and sandbox hosts.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;

use crate::dispatch::output::find_utf8_boundary;
use crate::error::{ExecError, Result};
use crate::process::{ExecutionSession, SessionExit};

/// How long to keep draining pipes after the process exits; grandchildren
/// may hold them open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A fully specified local command line.
#[derive(Debug, Clone, Default)]
pub struct LocalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// How supervision of a running child ended.
pub(crate) enum Stop {
    Exited(Option<i32>),
    WaitFailed(String),
    TimedOut,
    Killed,
}

impl Stop {
    pub(crate) fn into_exit(self, duration_ms: u64) -> SessionExit {
        let mut exit = SessionExit {
            exit_code: None,
            duration_ms,
            timed_out: false,
            killed: false,
            error: None,
        };
        match self {
            Self::Exited(code) => exit.exit_code = code,
            Self::WaitFailed(error) => exit.error = Some(error),
            Self::TimedOut => exit.timed_out = true,
            Self::Killed => exit.killed = true,
        }
        exit
    }
}

/// Spawns `spec` with piped output and supervises it on a background task.
pub fn spawn_piped(
    spec: LocalCommand,
    session: Arc<ExecutionSession>,
    run_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::Spawn(format!("{}: {e}", spec.program)))?;
    session.set_pid(child.id());
    tracing::debug!(
        session_id = %session.id(),
        pid = ?child.id(),
        program = %spec.program,
        "Spawned command"
    );

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump(stdout, session.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump(stderr, session.clone())));
    }

    tokio::spawn(async move {
        let stop = supervise(&mut child, &session, run_timeout, &cancel).await;
        for reader in readers {
            let _ = timeout(DRAIN_GRACE, reader).await;
        }
        session.finish(stop.into_exit(session.elapsed_ms()));
    });
    Ok(())
}

async fn supervise(
    child: &mut Child,
    session: &ExecutionSession,
    run_timeout: Duration,
    cancel: &CancellationToken,
) -> Stop {
    let deadline = sleep(run_timeout);
    tokio::pin!(deadline);
    let mut watch_cancel = true;

    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => Stop::Exited(status.code()),
                    Err(e) => Stop::WaitFailed(e.to_string()),
                };
            }
            _ = &mut deadline => {
                tracing::warn!(session_id = %session.id(), "Command timed out");
                terminate(child).await;
                return Stop::TimedOut;
            }
            _ = session.kill_token().cancelled() => {
                terminate(child).await;
                return Stop::Killed;
            }
            _ = cancel.cancelled(), if watch_cancel => {
                if session.claim_foreground() {
                    tracing::debug!(session_id = %session.id(), "Caller cancelled, killing command");
                    terminate(child).await;
                    return Stop::Killed;
                }
                // Backgrounded: the registry owns the process now.
                watch_cancel = false;
            }
        }
    }
}

/// SIGTERM to the process group, then SIGKILL after 500 ms.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);
        if timeout(Duration::from_millis(500), child.wait()).await.is_ok() {
            return;
        }
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    let _ = child.start_kill();
    let _ = timeout(DRAIN_GRACE, child.wait()).await;
}

async fn pump<R>(mut reader: R, session: Arc<ExecutionSession>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut incomplete: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let mut bytes = std::mem::take(&mut incomplete);
                bytes.extend_from_slice(&buf[..n]);
                let valid_up_to = find_utf8_boundary(&bytes);
                if valid_up_to > 0 {
                    session.append_output(&String::from_utf8_lossy(&bytes[..valid_up_to]));
                }
                if valid_up_to < bytes.len() {
                    incomplete = bytes[valid_up_to..].to_vec();
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Process output read error");
                break;
            }
        }
    }
    if !incomplete.is_empty() {
        session.append_output(&String::from_utf8_lossy(&incomplete));
    }
}
