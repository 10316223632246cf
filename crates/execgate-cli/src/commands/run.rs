use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use execgate_core::{ExecGateConfig, ExecOutcome, ExecRunner};
use execgate_traits::ExecEvent;
use tokio::sync::mpsc;

use crate::cli::RunArgs;
use crate::commands::{build_request, context};
use crate::output::{OutputFormat, json::print_json};
use crate::terminal::{TerminalApprover, TerminalSink};

/// Exit status for commands the gate refused to run.
pub const REFUSED_EXIT: u8 = 126;

/// Longest foreground wait the gate allows before backgrounding.
const FOREGROUND_YIELD_MS: u64 = 120_000;

pub async fn run(
    args: RunArgs,
    mut config: ExecGateConfig,
    format: OutputFormat,
) -> Result<ExitCode> {
    // Deferred runs report only through events.
    config.tools.exec.notify_on_exit = true;
    let max_output_chars = config.exec().max_output_chars;

    let (sink, mut done) = TerminalSink::new();
    let runner = ExecRunner::builder(config)
        .approver(Arc::new(TerminalApprover::new(args.approve)))
        .events(Arc::new(sink))
        .build();

    let mut request = build_request(&args.command, &args.policy);
    request.timeout = args.timeout;
    request.pty = args.pty;
    request.node = args.node.clone();
    request.yield_ms = Some(FOREGROUND_YIELD_MS);

    let outcome = match runner.execute(request, context(&args.policy)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if format.is_json() {
                print_json(&serde_json::json!({ "status": "refused", "error": e.to_string() }))?;
            } else {
                eprintln!("{} {}", "refused:".red().bold(), e);
            }
            return Ok(ExitCode::from(REFUSED_EXIT));
        }
    };

    match outcome {
        ExecOutcome::Completed { .. } | ExecOutcome::Failed { .. } => {
            report_outcome(&outcome, format)
        }
        ExecOutcome::Running { .. } | ExecOutcome::ApprovalPending { .. } => {
            tracing::debug!(status = outcome.status(), "Waiting for deferred run");
            wait_for_end(&runner, &mut done, max_output_chars, format).await
        }
    }
}

fn report_outcome(outcome: &ExecOutcome, format: OutputFormat) -> Result<ExitCode> {
    if format.is_json() {
        print_json(outcome)?;
    }
    match outcome {
        ExecOutcome::Completed {
            output, exit_code, ..
        } => {
            if !format.is_json() {
                print!("{output}");
            }
            Ok(exit_status(Some(*exit_code)))
        }
        ExecOutcome::Failed {
            output,
            reason,
            exit_code,
            ..
        } => {
            if !format.is_json() {
                print!("{output}");
                eprintln!("{} {}", "failed:".red().bold(), reason);
            }
            Ok(exit_status(exit_code.or(Some(1))))
        }
        _ => Ok(ExitCode::SUCCESS),
    }
}

async fn wait_for_end(
    runner: &ExecRunner,
    done: &mut mpsc::UnboundedReceiver<ExecEvent>,
    max_output_chars: usize,
    format: OutputFormat,
) -> Result<ExitCode> {
    let Some(event) = done.recv().await else {
        anyhow::bail!("event channel closed before the run ended");
    };
    if format.is_json() {
        print_json(&event)?;
    }
    match event {
        ExecEvent::Denied { .. } => Ok(ExitCode::from(REFUSED_EXIT)),
        ExecEvent::Finished {
            session_id,
            exit_code,
            success,
            tail,
            ..
        } => {
            if !format.is_json() {
                let output = runner
                    .registry()
                    .tail(&session_id, max_output_chars)
                    .unwrap_or(tail);
                print!("{output}");
            }
            if success {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(exit_status(exit_code.or(Some(1))))
            }
        }
        other => anyhow::bail!("unexpected event: {}", other.summary()),
    }
}

fn exit_status(code: Option<i32>) -> ExitCode {
    ExitCode::from(exit_byte(code))
}

fn exit_byte(code: Option<i32>) -> u8 {
    match code {
        Some(0) => 0,
        Some(code) => u8::try_from(code.clamp(1, 255)).unwrap_or(1),
        None => 1,
    }
}
