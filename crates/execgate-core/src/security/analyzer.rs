//! Command safety analysis.
//!
//! Splits a command into segments, resolves each segment's executable and
//! checks it against the allowlist patterns and the safe-bin set. Anything
//! that cannot be parsed or resolved fails closed.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use execgate_traits::ExecSecurity;

use crate::error::SanitizeError;
use crate::models::{AllowlistMatch, CommandAnalysis, MatchSource, SegmentAnalysis};
use crate::security::path_resolver::{CommandResolution, Platform, matches_path_pattern};
use crate::security::shell_parser;

pub fn analyze(
    command: &str,
    allowlist: &[String],
    safe_bins: &BTreeSet<String>,
    cwd: &Path,
    env: &HashMap<String, String>,
    platform: Platform,
) -> CommandAnalysis {
    let parsed = match shell_parser::parse(command) {
        Ok(parsed) => parsed,
        Err(reason) => {
            tracing::debug!(reason = %reason, "Command failed to parse");
            return CommandAnalysis::failed(reason);
        }
    };

    let mut segments = Vec::new();
    let mut allowlist_matches = Vec::new();
    let mut failure_reason = None;

    for words in parsed.segments() {
        let argv: Vec<String> = words.iter().map(|w| w.value.clone()).collect();
        let raw = words
            .iter()
            .map(|w| w.raw.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let token = argv.first().cloned().unwrap_or_default();
        let resolution = CommandResolution::resolve(&token, cwd, env, platform);

        let mut segment = SegmentAnalysis {
            raw,
            argv,
            executable_name: resolution.executable_name.clone(),
            resolved_path: resolution.resolved_path.clone(),
            matched_by: MatchSource::None,
            pattern: None,
        };

        if resolution.resolved_path.is_none() {
            failure_reason.get_or_insert_with(|| format!("Unable to resolve executable '{token}'"));
        } else if let Some(pattern) = allowlist
            .iter()
            .find(|p| matches_path_pattern(p, &resolution, platform))
        {
            segment.matched_by = MatchSource::AllowlistPattern;
            segment.pattern = Some(pattern.clone());
            allowlist_matches.push(AllowlistMatch {
                pattern: pattern.clone(),
                resolved_path: resolution
                    .resolved_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            });
        } else if is_safe_bin_usage(&segment.argv, &resolution, safe_bins, cwd, platform) {
            segment.matched_by = MatchSource::SafeBin;
        }

        segments.push(segment);
    }

    let analysis_ok = failure_reason.is_none();
    let allowlist_satisfied = analysis_ok && segments.iter().all(SegmentAnalysis::is_satisfied);

    CommandAnalysis {
        segments,
        analysis_ok,
        allowlist_satisfied,
        allowlist_matches,
        failure_reason,
        parsed: Some(parsed),
    }
}

/// A safe bin may only read stdin: it must be looked up by name and none of
/// its arguments may point at a file.
fn is_safe_bin_usage(
    argv: &[String],
    resolution: &CommandResolution,
    safe_bins: &BTreeSet<String>,
    cwd: &Path,
    platform: Platform,
) -> bool {
    if resolution.explicit_path || resolution.resolved_path.is_none() {
        return false;
    }
    let listed = safe_bins
        .iter()
        .any(|bin| platform.normalize_name(bin.trim()) == resolution.executable_name);
    if !listed {
        return false;
    }
    !argv
        .iter()
        .skip(1)
        .any(|arg| is_path_like(arg, cwd, platform))
}

fn is_path_like(arg: &str, cwd: &Path, platform: Platform) -> bool {
    if arg.starts_with('-') {
        return match arg.split_once('=') {
            Some((_, value)) => is_path_like(value, cwd, platform),
            None => platform.has_separator(arg),
        };
    }
    if arg.is_empty() {
        return false;
    }
    if arg == "." || arg == ".." || arg.starts_with('~') {
        return true;
    }
    if platform.has_separator(arg) {
        return true;
    }
    platform.is_native() && cwd.join(arg).exists()
}

/// The command line to run for a verdict reached under `security`. Safe-bin
/// segments get literal arguments; under `full` the command runs as written.
pub fn literal_command(
    analysis: &CommandAnalysis,
    security: ExecSecurity,
) -> Result<Option<String>, SanitizeError> {
    if security == ExecSecurity::Full || !analysis.needs_literal_rendering() {
        return Ok(None);
    }
    match analysis.render_with_literal_arguments() {
        Ok(rendered) => Ok(Some(rendered)),
        Err(err) => {
            tracing::debug!(error = %err, "Per-segment rendering failed, quoting whole command");
            analysis.render_whole_literal().map(Some)
        }
    }
}
