//! Command lines for the privileged local host.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::dispatch::local::LocalCommand;
use crate::error::{ExecError, Result};
use crate::security::env_guard::validate_host_env;
use crate::security::path_resolver::expand_home;

/// Builds the shell invocation for `command`. `env` is validated before
/// anything is merged.
pub fn build_command(
    command: &str,
    workdir: &Path,
    env: &HashMap<String, String>,
    path_prepend: &[String],
) -> Result<LocalCommand> {
    validate_host_env(env)?;

    let mut merged: Vec<(String, String)> = env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged.sort();
    if let Some(path) = prepended_path(path_prepend, std::env::var_os("PATH"))? {
        merged.push(("PATH".to_string(), path));
    }

    let (program, args) = shell_invocation(command);
    Ok(LocalCommand {
        program,
        args,
        cwd: Some(workdir.to_path_buf()),
        env: merged,
    })
}

#[cfg(not(windows))]
fn shell_invocation(command: &str) -> (String, Vec<String>) {
    ("/bin/sh".to_string(), vec!["-c".to_string(), command.to_string()])
}

#[cfg(windows)]
fn shell_invocation(command: &str) -> (String, Vec<String>) {
    (
        "cmd.exe".to_string(),
        vec!["/d".into(), "/s".into(), "/c".into(), command.to_string()],
    )
}

/// The `PATH` a gateway command runs with: configured entries first, then
/// the host `PATH`.
pub fn effective_path(path_prepend: &[String]) -> Result<Option<String>> {
    let current = std::env::var_os("PATH");
    Ok(prepended_path(path_prepend, current.clone())?
        .or_else(|| current.map(|path| path.to_string_lossy().into_owned())))
}

/// `PATH` with the configured entries in front, or `None` when nothing is
/// configured.
fn prepended_path(prepend: &[String], current: Option<OsString>) -> Result<Option<String>> {
    let extra: Vec<PathBuf> = prepend
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(expand_home)
        .collect();
    if extra.is_empty() {
        return Ok(None);
    }
    let existing: Vec<PathBuf> = current
        .as_deref()
        .map(|path| std::env::split_paths(path).collect())
        .unwrap_or_default();
    let joined = std::env::join_paths(extra.into_iter().chain(existing))
        .map_err(|e| ExecError::InvalidRequest(format!("invalid path_prepend entry: {e}")))?;
    Ok(Some(joined.to_string_lossy().into_owned()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_build_command_runs_through_sh() {
        let env = HashMap::from([("FOO".to_string(), "bar".to_string())]);
        let cmd = build_command("echo $FOO", Path::new("/tmp"), &env, &[]).unwrap();
        assert_eq!(cmd.program, "/bin/sh");
        assert_eq!(cmd.args, vec!["-c", "echo $FOO"]);
        assert_eq!(cmd.cwd.as_deref(), Some(Path::new("/tmp")));
        assert_eq!(cmd.env, vec![("FOO".to_string(), "bar".to_string())]);
    }

    #[test]
    fn test_build_command_rejects_dangerous_env() {
        let env = HashMap::from([("LD_PRELOAD".to_string(), "/tmp/x.so".to_string())]);
        let err = build_command("ls", Path::new("/tmp"), &env, &[]).unwrap_err();
        assert!(matches!(err, ExecError::EnvRejected(_)));
    }

    #[test]
    fn test_prepended_path_order() {
        let path = prepended_path(
            &["/opt/tools/bin".to_string(), " ".to_string()],
            Some(OsString::from("/usr/bin:/bin")),
        )
        .unwrap()
        .unwrap();
        assert_eq!(path, "/opt/tools/bin:/usr/bin:/bin");
        assert!(prepended_path(&[], Some(OsString::from("/bin"))).unwrap().is_none());
    }

    #[test]
    fn test_effective_path_matches_spawned_path() {
        let prepend = vec!["/opt/tools/bin".to_string()];
        let path = effective_path(&prepend).unwrap().unwrap();
        assert!(path.starts_with("/opt/tools/bin"));

        let cmd = build_command("ls", Path::new("/tmp"), &HashMap::new(), &prepend).unwrap();
        let spawned = cmd.env.iter().find(|(k, _)| k == "PATH").map(|(_, v)| v.as_str());
        assert_eq!(spawned, Some(path.as_str()));

        let host = std::env::var("PATH").ok();
        assert_eq!(effective_path(&[]).unwrap(), host);
    }
}
