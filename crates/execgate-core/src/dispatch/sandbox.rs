//! `docker exec` into the configured sandbox container.

use std::collections::HashMap;
use std::path::Path;

use crate::config::SandboxConfig;
use crate::dispatch::local::LocalCommand;
use crate::error::{ExecError, Result};

/// Builds the `docker exec` invocation. The container's own environment is
/// reset to a known `PATH` and `HOME`; request variables are passed through
/// because they only reach the container.
pub fn build_command(
    sandbox: Option<&SandboxConfig>,
    command: &str,
    workdir: &Path,
    env: &HashMap<String, String>,
) -> Result<(LocalCommand, String)> {
    let sandbox = sandbox.ok_or_else(|| {
        ExecError::SandboxUnavailable(
            "no sandbox container configured (tools.exec.sandbox.container)".to_string(),
        )
    })?;
    if sandbox.container.trim().is_empty() {
        return Err(ExecError::SandboxUnavailable(
            "sandbox container name is empty".to_string(),
        ));
    }
    for key in env.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(ExecError::InvalidRequest(format!(
                "invalid environment variable name '{key}'"
            )));
        }
    }

    let container_dir = container_workdir(sandbox, workdir);
    let mut args = vec![
        "exec".to_string(),
        "-i".to_string(),
        "-w".to_string(),
        container_dir.clone(),
        "-e".to_string(),
        format!("PATH={}", sandbox.default_path),
        "-e".to_string(),
        format!("HOME={}", sandbox.container_workdir),
    ];
    for (key, value) in &sandbox.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    let mut request_env: Vec<(&String, &String)> = env.iter().collect();
    request_env.sort();
    for (key, value) in request_env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(sandbox.container.clone());
    args.extend(["sh".to_string(), "-lc".to_string(), command.to_string()]);

    Ok((
        LocalCommand {
            program: sandbox.docker_binary.clone(),
            args,
            cwd: None,
            env: Vec::new(),
        },
        container_dir,
    ))
}

/// Maps a host directory under the mounted workspace to its path inside the
/// container. Anything outside the workspace falls back to the container
/// workdir.
pub fn container_workdir(sandbox: &SandboxConfig, workdir: &Path) -> String {
    let base = sandbox.container_workdir.trim_end_matches('/');
    let Some(workspace) = &sandbox.workspace_dir else {
        return sandbox.container_workdir.clone();
    };
    match workdir.strip_prefix(workspace) {
        Ok(relative) if relative.as_os_str().is_empty() => sandbox.container_workdir.clone(),
        Ok(relative) => {
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            format!("{base}/{}", parts.join("/"))
        }
        Err(_) => {
            tracing::warn!(
                workdir = %workdir.display(),
                workspace = %workspace.display(),
                "Workdir is outside the sandbox workspace, using container workdir"
            );
            sandbox.container_workdir.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sandbox() -> SandboxConfig {
        let mut sandbox = SandboxConfig::new("agent-box");
        sandbox.workspace_dir = Some(PathBuf::from("/home/me/work"));
        sandbox.env.insert("LANG".into(), "C.UTF-8".into());
        sandbox
    }

    #[test]
    fn test_requires_configured_container() {
        let err = build_command(None, "ls", Path::new("/tmp"), &HashMap::new()).unwrap_err();
        assert!(matches!(err, ExecError::SandboxUnavailable(_)));
    }

    #[test]
    fn test_docker_exec_argv() {
        let env = HashMap::from([("FOO".to_string(), "1".to_string())]);
        let (cmd, dir) = build_command(
            Some(&sandbox()),
            "make test",
            Path::new("/home/me/work/proj"),
            &env,
        )
        .unwrap();
        assert_eq!(cmd.program, "docker");
        assert_eq!(dir, "/workspace/proj");
        assert_eq!(
            cmd.args,
            vec![
                "exec",
                "-i",
                "-w",
                "/workspace/proj",
                "-e",
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                "-e",
                "HOME=/workspace",
                "-e",
                "LANG=C.UTF-8",
                "-e",
                "FOO=1",
                "agent-box",
                "sh",
                "-lc",
                "make test",
            ]
        );
    }

    #[test]
    fn test_workdir_outside_workspace_falls_back() {
        assert_eq!(
            container_workdir(&sandbox(), Path::new("/etc")),
            "/workspace"
        );
        assert_eq!(
            container_workdir(&sandbox(), Path::new("/home/me/work")),
            "/workspace"
        );
    }
}
