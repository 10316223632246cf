use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use execgate_traits::{ExecAsk, ExecHost, ExecSecurity};

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "execgate")]
#[command(version, about = "ExecGate - gated shell execution for agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.execgate/config.toml)
    #[arg(long, global = true, env = "EXECGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write logs to daily files in this directory instead of stderr
    #[arg(long, global = true, env = "EXECGATE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command through the exec gate
    Run(RunArgs),

    /// Show how a command would be judged without running it
    Analyze(AnalyzeArgs),

    /// Manage the persisted allowlist
    Approvals {
        #[command(subcommand)]
        command: ApprovalsCommands,
    },

    /// Print the exec tool input schema
    Schema,
}

#[derive(Args, Clone)]
pub struct PolicyArgs {
    /// Agent the request is made on behalf of
    #[arg(long, default_value = "main")]
    pub agent: String,

    /// Working directory
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Execution host override
    #[arg(long)]
    pub host: Option<ExecHost>,

    /// Security mode override
    #[arg(long)]
    pub security: Option<ExecSecurity>,

    /// Ask mode override
    #[arg(long)]
    pub ask: Option<ExecAsk>,

    /// Extra environment variables (KEY=VALUE)
    #[arg(long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub policy: PolicyArgs,

    /// Timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Run under a pseudo-terminal
    #[arg(long)]
    pub pty: bool,

    /// Target node for host=node
    #[arg(long)]
    pub node: Option<String>,

    /// Answer approval prompts without asking
    #[arg(long, value_enum)]
    pub approve: Option<ApproveAnswer>,

    /// Command to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub policy: PolicyArgs,

    /// Command to analyze
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApproveAnswer {
    Once,
    Always,
    Deny,
}

#[derive(Subcommand)]
pub enum ApprovalsCommands {
    /// List allowlist entries
    List {
        /// Only this agent
        #[arg(long)]
        agent: Option<String>,
    },

    /// Add an allowlist pattern
    Add {
        pattern: String,
        #[arg(long, default_value = "main")]
        agent: String,
    },

    /// Remove an allowlist pattern
    Remove {
        pattern: String,
        #[arg(long, default_value = "main")]
        agent: String,
    },
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "execgate",
            "run",
            "--security",
            "full",
            "--env",
            "FOO=bar",
            "ls",
            "-la",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.command, vec!["ls", "-la"]);
        assert_eq!(args.policy.security, Some(ExecSecurity::Full));
        assert_eq!(args.policy.env, vec![("FOO".to_string(), "bar".to_string())]);
        assert_eq!(args.policy.agent, "main");
    }

    #[test]
    fn test_env_pair_requires_equals() {
        assert!(parse_env_pair("FOO").is_err());
        assert!(parse_env_pair("=x").is_err());
        assert_eq!(
            parse_env_pair("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
    }

    #[test]
    fn test_unknown_host_is_rejected() {
        assert!(Cli::try_parse_from(["execgate", "run", "--host", "moon", "ls"]).is_err());
    }
}
