//! PTY-backed gateway commands.

use std::io::Read;
use std::sync::Arc;
use std::thread;

use portable_pty::{Child, ChildKiller, CommandBuilder, PtySize, native_pty_system};
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::dispatch::local::{LocalCommand, Stop};
use crate::dispatch::output::find_utf8_boundary;
use crate::error::{ExecError, Result};
use crate::process::ExecutionSession;

const DEFAULT_PTY_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 80,
    pixel_width: 0,
    pixel_height: 0,
};

const REAP_GRACE: Duration = Duration::from_secs(2);

/// Spawns `spec` attached to a pseudo terminal. Output is merged into a
/// single stream by the terminal.
pub fn spawn_pty(
    spec: LocalCommand,
    session: Arc<ExecutionSession>,
    run_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let pair = native_pty_system()
        .openpty(DEFAULT_PTY_SIZE)
        .map_err(|e| ExecError::Spawn(format!("openpty: {e}")))?;

    let mut cmd = CommandBuilder::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        cmd.cwd(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ExecError::Spawn(format!("{}: {e}", spec.program)))?;
    drop(pair.slave);
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ExecError::Spawn(format!("pty reader: {e}")))?;
    session.set_pid(child.process_id());

    let reader_thread = create_reader_thread(session.clone(), reader);
    let mut killer = child.clone_killer();
    let master = pair.master;

    tokio::spawn(async move {
        let mut wait = tokio::task::spawn_blocking(move || child.wait());
        let deadline = sleep(run_timeout);
        tokio::pin!(deadline);
        let mut watch_cancel = true;

        let stop = loop {
            tokio::select! {
                status = &mut wait => {
                    break match status {
                        Ok(Ok(status)) => Stop::Exited(Some(status.exit_code() as i32)),
                        Ok(Err(e)) => Stop::WaitFailed(e.to_string()),
                        Err(e) => Stop::WaitFailed(e.to_string()),
                    };
                }
                _ = &mut deadline => {
                    tracing::warn!(session_id = %session.id(), "PTY command timed out");
                    let _ = killer.kill();
                    break Stop::TimedOut;
                }
                _ = session.kill_token().cancelled() => {
                    let _ = killer.kill();
                    break Stop::Killed;
                }
                _ = cancel.cancelled(), if watch_cancel => {
                    if session.claim_foreground() {
                        let _ = killer.kill();
                        break Stop::Killed;
                    }
                    watch_cancel = false;
                }
            }
        };

        if !matches!(stop, Stop::Exited(_) | Stop::WaitFailed(_)) {
            let _ = timeout(REAP_GRACE, &mut wait).await;
        }
        // Closing the master ends the reader thread.
        drop(master);
        let _ = timeout(
            REAP_GRACE,
            tokio::task::spawn_blocking(move || reader_thread.join()),
        )
        .await;
        session.finish(stop.into_exit(session.elapsed_ms()));
    });
    Ok(())
}

fn create_reader_thread(
    session: Arc<ExecutionSession>,
    mut reader: Box<dyn Read + Send>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut incomplete_utf8: Vec<u8> = Vec::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let mut bytes = std::mem::take(&mut incomplete_utf8);
                    bytes.extend_from_slice(&buf[..n]);
                    let valid_up_to = find_utf8_boundary(&bytes);
                    if valid_up_to > 0 {
                        session.append_output(&String::from_utf8_lossy(&bytes[..valid_up_to]));
                    }
                    if valid_up_to < bytes.len() {
                        incomplete_utf8 = bytes[valid_up_to..].to_vec();
                    }
                }
                // EIO once the child side closes.
                Err(_) => break,
            }
        }
        if !incomplete_utf8.is_empty() {
            session.append_output(&String::from_utf8_lossy(&incomplete_utf8));
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use execgate_traits::ExecHost;

    #[tokio::test]
    async fn test_pty_output_and_exit_code() {
        let session = Arc::new(ExecutionSession::new("printf", "/", ExecHost::Gateway, 10_000));
        spawn_pty(
            LocalCommand {
                program: "/bin/sh".into(),
                args: vec!["-c".into(), "printf hello-pty; exit 4".into()],
                cwd: None,
                env: Vec::new(),
            },
            session.clone(),
            Duration::from_secs(10),
            CancellationToken::new(),
        )
        .unwrap();
        let exit = session.wait().await;
        assert_eq!(exit.exit_code, Some(4));
        assert!(session.output().0.contains("hello-pty"));
    }
}
