use anyhow::Result;
use comfy_table::{Cell, Table};
use execgate_core::ExecGateConfig;
use execgate_core::security::AllowlistStore;
use serde_json::json;

use crate::cli::ApprovalsCommands;
use crate::output::{OutputFormat, json::print_json, table::print_table};

pub async fn run(
    command: ApprovalsCommands,
    config: &ExecGateConfig,
    format: OutputFormat,
) -> Result<()> {
    let store = AllowlistStore::new(config.approvals_path());
    match command {
        ApprovalsCommands::List { agent } => list(&store, agent.as_deref(), format).await,
        ApprovalsCommands::Add { pattern, agent } => {
            let added = store.add_entry(&agent, &pattern).await?;
            if format.is_json() {
                return print_json(&json!({ "agent": agent, "pattern": pattern, "added": added }));
            }
            if added {
                println!("Added {pattern} for agent {agent}");
            } else {
                println!("{pattern} is already allowed for agent {agent}");
            }
            Ok(())
        }
        ApprovalsCommands::Remove { pattern, agent } => {
            let removed = store.remove_entry(&agent, &pattern).await?;
            if format.is_json() {
                return print_json(
                    &json!({ "agent": agent, "pattern": pattern, "removed": removed }),
                );
            }
            if !removed {
                anyhow::bail!("No entry {pattern} for agent {agent}");
            }
            println!("Removed {pattern} for agent {agent}");
            Ok(())
        }
    }
}

async fn list(store: &AllowlistStore, agent: Option<&str>, format: OutputFormat) -> Result<()> {
    let file = store.load().await?;
    let agents: Vec<_> = file
        .agents
        .iter()
        .filter(|(id, _)| agent.is_none_or(|wanted| wanted == id.as_str()))
        .collect();

    if format.is_json() {
        let map: serde_json::Map<String, serde_json::Value> = agents
            .iter()
            .map(|(id, approvals)| Ok(((*id).clone(), serde_json::to_value(&approvals.allowlist)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        return print_json(&map);
    }

    if agents.iter().all(|(_, approvals)| approvals.allowlist.is_empty()) {
        println!("Allowlist is empty.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Agent", "Pattern", "Uses", "Last command"]);
    for (id, approvals) in agents {
        for entry in &approvals.allowlist {
            table.add_row(vec![
                Cell::new(id),
                Cell::new(&entry.pattern),
                Cell::new(entry.use_count),
                Cell::new(entry.last_used_command.clone().unwrap_or_default()),
            ]);
        }
    }
    print_table(table)
}
