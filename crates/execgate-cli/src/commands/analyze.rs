use anyhow::Result;
use colored::Colorize;
use comfy_table::{Cell, Table};
use execgate_core::dispatch::gateway;
use execgate_core::security::{
    AllowlistStore, Platform, PolicyResolver, literal_command, requires_approval,
};
use execgate_core::{CommandAnalysis, EffectivePolicy, ExecGateConfig, MatchSource};
use execgate_traits::{ExecHost, ExecSecurity};
use serde_json::json;

use crate::cli::AnalyzeArgs;
use crate::commands::{build_request, context};
use crate::output::{OutputFormat, json::print_json, table::print_table};

pub async fn run(args: AnalyzeArgs, config: ExecGateConfig, format: OutputFormat) -> Result<()> {
    let request = build_request(&args.command, &args.policy);
    let ctx = context(&args.policy);

    let store = AllowlistStore::new(config.approvals_path());
    let file = store.load().await?;
    let policy = PolicyResolver::new(&config).resolve_request(&request, &ctx, &file)?;
    let cwd = match &request.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut env = request.env.clone();
    if policy.host == ExecHost::Gateway
        && let Some(path) = gateway::effective_path(&config.tools.exec.path_prepend)?
    {
        env.insert("PATH".to_string(), path);
    }
    let analysis = store
        .evaluate(
            &ctx.agent_id,
            &request.command,
            &policy,
            &cwd,
            &env,
            Platform::current(),
        )
        .await?;
    let verdict = verdict(&policy, &analysis);
    let sanitized = literal_command(&analysis, policy.security).ok().flatten();

    if format.is_json() {
        return print_json(&json!({
            "policy": policy,
            "analysis": analysis,
            "verdict": verdict,
            "sanitized": sanitized,
        }));
    }

    println!(
        "host={} security={} ask={} fallback={}",
        policy.host, policy.security, policy.ask, policy.ask_fallback
    );

    let mut table = Table::new();
    table.set_header(vec!["Segment", "Executable", "Resolved", "Matched by"]);
    for segment in &analysis.segments {
        let matched = match segment.matched_by {
            MatchSource::None => "-".to_string(),
            MatchSource::SafeBin => "safe bin".to_string(),
            MatchSource::AllowlistPattern => segment.pattern.clone().unwrap_or_default(),
        };
        table.add_row(vec![
            Cell::new(&segment.raw),
            Cell::new(&segment.executable_name),
            Cell::new(
                segment
                    .resolved_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(matched),
        ]);
    }
    print_table(table)?;

    if let Some(reason) = &analysis.failure_reason {
        println!("{} {}", "analysis failed:".red(), reason);
    }
    if let Some(command) = sanitized {
        println!("runs as: {command}");
    }
    let label = match verdict {
        "allow" => verdict.green(),
        "ask" => verdict.yellow(),
        _ => verdict.red(),
    };
    println!("verdict: {label}");
    Ok(())
}

/// What the gate would do with the command without a human in the loop.
fn verdict(policy: &EffectivePolicy, analysis: &CommandAnalysis) -> &'static str {
    if policy.security == ExecSecurity::Deny {
        return "deny";
    }
    if requires_approval(
        policy.ask,
        policy.security,
        analysis.analysis_ok,
        analysis.allowlist_satisfied,
    ) {
        return "ask";
    }
    if policy.security == ExecSecurity::Allowlist && !analysis.allowlist_satisfied {
        return "deny";
    }
    "allow"
}
