//! Command analysis results.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SanitizeError;
use crate::security::shell_parser::{self, ParsedCommand};

/// What satisfied a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum MatchSource {
    #[default]
    None,
    SafeBin,
    AllowlistPattern,
}

/// One command of a pipeline or sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentAnalysis {
    /// Source text of the segment as written.
    pub raw: String,
    /// Words after quote removal.
    pub argv: Vec<String>,
    pub executable_name: String,
    pub resolved_path: Option<PathBuf>,
    pub matched_by: MatchSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl SegmentAnalysis {
    pub fn is_satisfied(&self) -> bool {
        self.matched_by != MatchSource::None
    }
}

/// Allowlist pattern usage, fed back to the store for stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistMatch {
    pub pattern: String,
    pub resolved_path: Option<String>,
}

/// Safety verdict for a whole command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAnalysis {
    pub segments: Vec<SegmentAnalysis>,
    /// Every segment parsed and its executable resolved.
    pub analysis_ok: bool,
    /// Every segment satisfied by an allowlist pattern or a safe bin.
    pub allowlist_satisfied: bool,
    pub allowlist_matches: Vec<AllowlistMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip)]
    pub(crate) parsed: Option<ParsedCommand>,
}

impl CommandAnalysis {
    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Resolved path of the first segment's executable.
    pub fn primary_resolved_path(&self) -> Option<&PathBuf> {
        self.segments.first().and_then(|s| s.resolved_path.as_ref())
    }

    /// Resolved paths of every segment, in order, without duplicates.
    pub fn resolved_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for path in self.segments.iter().filter_map(|s| s.resolved_path.clone()) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    /// True when some segment was let through only as a safe bin; those
    /// segments must run with literal arguments.
    pub fn needs_literal_rendering(&self) -> bool {
        self.segments
            .iter()
            .any(|s| s.matched_by == MatchSource::SafeBin)
    }

    /// Re-renders the command with every safe-bin segment's arguments
    /// single-quoted so the shell performs no glob or variable expansion.
    pub fn render_with_literal_arguments(&self) -> Result<String, SanitizeError> {
        let parsed = self.renderable()?;
        shell_parser::render(parsed, |segment, index, word| {
            let analysis = &self.segments[segment];
            if analysis.matched_by != MatchSource::SafeBin {
                return Ok(word.raw.clone());
            }
            literal_word(analysis, index, &word.value)
        })
    }

    /// Fallback rendering: quotes every word. Only single-segment commands
    /// can be rendered this way without changing their structure.
    pub fn render_whole_literal(&self) -> Result<String, SanitizeError> {
        let parsed = self.renderable()?;
        if self.segments.len() != 1 {
            return Err(SanitizeError::Ambiguous(format!(
                "{} segments cannot be quoted as a single literal command",
                self.segments.len()
            )));
        }
        shell_parser::render(parsed, |segment, index, word| {
            literal_word(&self.segments[segment], index, &word.value)
        })
    }

    fn renderable(&self) -> Result<&ParsedCommand, SanitizeError> {
        if !self.analysis_ok {
            return Err(SanitizeError::Unanalyzable(
                self.failure_reason
                    .clone()
                    .unwrap_or_else(|| "analysis failed".to_string()),
            ));
        }
        self.parsed
            .as_ref()
            .ok_or_else(|| SanitizeError::Unanalyzable("no parsed command".to_string()))
    }
}

fn literal_word(
    segment: &SegmentAnalysis,
    index: usize,
    value: &str,
) -> Result<String, SanitizeError> {
    if index == 0
        && let Some(path) = &segment.resolved_path
    {
        return shell_parser::quote_literal(&path.to_string_lossy());
    }
    shell_parser::quote_literal(value)
}
