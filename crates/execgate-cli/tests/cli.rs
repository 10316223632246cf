use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;

fn execgate() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("execgate"));
    cmd.env_remove("RUST_LOG").env_remove("EXECGATE_CONFIG");
    cmd
}

fn write_config(dir: &Path, exec_keys: &str) -> PathBuf {
    let approvals = dir.join("exec-approvals.json");
    let path = dir.join("config.toml");
    let content = format!(
        "[tools.exec]\napprovals_file = \"{}\"\napproval_timeout_ms = 500\n{exec_keys}\n",
        approvals.display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_cli_help() {
    execgate()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("ExecGate"));
}

#[test]
fn test_cli_version() {
    execgate().arg("--version").assert().success();
}

#[test]
fn test_schema_lists_command() {
    execgate()
        .arg("schema")
        .assert()
        .success()
        .stdout(contains("\"command\""));
}

#[test]
fn test_approvals_add_list_remove() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    execgate()
        .arg("--config")
        .arg(&config)
        .args(["approvals", "add", "/usr/bin/git", "--agent", "main"])
        .assert()
        .success()
        .stdout(contains("Added /usr/bin/git"));

    execgate()
        .arg("--config")
        .arg(&config)
        .args(["approvals", "list"])
        .assert()
        .success()
        .stdout(contains("/usr/bin/git"));

    execgate()
        .arg("--config")
        .arg(&config)
        .args(["approvals", "remove", "/usr/bin/git"])
        .assert()
        .success();

    execgate()
        .arg("--config")
        .arg(&config)
        .args(["approvals", "list"])
        .assert()
        .success()
        .stdout(contains("Allowlist is empty."));
}

#[test]
fn test_remove_unknown_pattern_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");
    execgate()
        .arg("--config")
        .arg(&config)
        .args(["approvals", "remove", "/bin/nothing"])
        .assert()
        .failure();
}

#[test]
fn test_analyze_reports_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "host = \"gateway\"\nsecurity = \"allowlist\"\nask = \"on-miss\"",
    );
    execgate()
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "analyze", "--workdir"])
        .arg(dir.path())
        .args(["--", "echo", "$(whoami)"])
        .assert()
        .success()
        .stdout(contains("\"verdict\": \"ask\""));
}

#[cfg(unix)]
#[test]
fn test_run_full_security_prints_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "host = \"gateway\"\nsecurity = \"full\"\nask = \"off\"",
    );
    execgate()
        .arg("--config")
        .arg(&config)
        .args(["run", "--workdir"])
        .arg(dir.path())
        .args(["--", "echo", "hello-gate"])
        .assert()
        .success()
        .stdout(contains("hello-gate"));
}

#[cfg(unix)]
#[test]
fn test_run_propagates_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "host = \"gateway\"\nsecurity = \"full\"\nask = \"off\"",
    );
    execgate()
        .arg("--config")
        .arg(&config)
        .args(["run", "--workdir"])
        .arg(dir.path())
        .args(["--", "exit 7"])
        .assert()
        .code(7);
}

#[test]
fn test_run_security_deny_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "host = \"gateway\"\nsecurity = \"deny\"");
    execgate()
        .arg("--config")
        .arg(&config)
        .args(["run", "--workdir"])
        .arg(dir.path())
        .args(["--", "echo", "nope"])
        .assert()
        .code(126)
        .stderr(contains("security=deny"));
}

#[cfg(unix)]
#[test]
fn test_run_denied_approval_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "host = \"gateway\"\nsecurity = \"allowlist\"\nask = \"always\"",
    );
    execgate()
        .arg("--config")
        .arg(&config)
        .args(["run", "--approve", "deny", "--workdir"])
        .arg(dir.path())
        .args(["--", "echo", "nope"])
        .assert()
        .code(126)
        .stdout(contains("nope").not());
}
