//! Security policy resolution.
//!
//! Scopes are folded most specific first. `security` and `askFallback` take
//! the minimum, `ask` the maximum, so adding a scope can only tighten the
//! result. `host` comes from the most specific scope that names one.

use execgate_traits::{ExecAsk, ExecHost, ExecSecurity, max_ask, min_security};

use crate::config::ExecGateConfig;
use crate::error::{ExecError, Result};
use crate::models::{
    ApprovalsFile, EffectivePolicy, ElevatedLevel, ExecContext, ExecRequest, PolicyFragment,
    default_safe_bins,
};

/// Folds `scopes` (most specific first) into a fully determined policy.
pub fn resolve(scopes: &[PolicyFragment]) -> EffectivePolicy {
    let host = scopes
        .iter()
        .find_map(|s| s.host)
        .unwrap_or(ExecHost::Sandbox);

    let security = scopes
        .iter()
        .filter_map(|s| s.security)
        .reduce(min_security)
        .unwrap_or(match host {
            ExecHost::Sandbox => ExecSecurity::Deny,
            ExecHost::Gateway | ExecHost::Node => ExecSecurity::Allowlist,
        });

    let ask = scopes
        .iter()
        .filter_map(|s| s.ask)
        .reduce(max_ask)
        .unwrap_or(ExecAsk::OnMiss);

    let ask_fallback = scopes
        .iter()
        .filter_map(|s| s.ask_fallback)
        .reduce(min_security)
        .unwrap_or(ExecSecurity::Deny);

    let mut allowlist: Vec<String> = Vec::new();
    for pattern in scopes.iter().flat_map(|s| s.allowlist.iter()) {
        let pattern = pattern.trim();
        if !pattern.is_empty() && !allowlist.iter().any(|p| p == pattern) {
            allowlist.push(pattern.to_string());
        }
    }

    let safe_bins = scopes
        .iter()
        .find_map(|s| s.safe_bins.as_ref())
        .map(|bins| {
            bins.iter()
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect()
        })
        .unwrap_or_else(default_safe_bins);

    EffectivePolicy {
        host,
        security,
        ask,
        ask_fallback,
        allowlist,
        safe_bins,
        elevated: None,
    }
}

/// Builds and folds the scopes that apply to one request.
pub struct PolicyResolver<'a> {
    config: &'a ExecGateConfig,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(config: &'a ExecGateConfig) -> Self {
        Self { config }
    }

    /// Configured scopes, most specific first, excluding the request itself.
    pub fn configured_scopes(
        &self,
        ctx: &ExecContext,
        approvals: &ApprovalsFile,
    ) -> Vec<PolicyFragment> {
        let exec = self.config.exec();
        let mut scopes = Vec::new();

        if let Some(provider) = ctx.provider.as_deref()
            && let Some(policy) = exec.by_provider.get(provider)
        {
            scopes.push(policy.to_fragment(format!("tools.exec.by_provider.{provider}")));
        }
        if let Some(agent) = self.config.agent(&ctx.agent_id) {
            scopes.push(
                agent
                    .tools
                    .exec
                    .to_fragment(format!("agents.{}.tools.exec", ctx.agent_id)),
            );
        }
        scopes.extend(approvals.fragments_for(&ctx.agent_id));
        let patterns = approvals.patterns_for(&ctx.agent_id);
        if !patterns.is_empty() {
            scopes.push(PolicyFragment::named("approvals.allowlist").with_allowlist(patterns));
        }
        scopes.push(exec.policy.to_fragment("tools.exec"));

        scopes.retain(|s| !s.is_empty());
        scopes
    }

    /// Effective policy for `request`, or the reason it must be rejected
    /// before analysis.
    pub fn resolve_request(
        &self,
        request: &ExecRequest,
        ctx: &ExecContext,
        approvals: &ApprovalsFile,
    ) -> Result<EffectivePolicy> {
        let elevated = if request.elevated {
            Some(self.check_elevated(ctx)?)
        } else {
            None
        };

        let configured = self.configured_scopes(ctx, approvals);
        let configured_host = configured
            .iter()
            .find_map(|s| s.host)
            .unwrap_or_default();

        if let Some(requested) = request.host
            && requested != configured_host
            && elevated.is_none()
        {
            tracing::warn!(
                agent_id = %ctx.agent_id,
                requested = %requested,
                configured = %configured_host,
                "Rejected exec host override"
            );
            return Err(ExecError::HostNotAllowed { requested });
        }

        let mut scopes = Vec::with_capacity(configured.len() + 2);
        if elevated.is_some() {
            scopes.push(PolicyFragment::named("elevated").with_host(ExecHost::Gateway));
        }
        let request_scope = PolicyFragment {
            scope: Some("request".to_string()),
            host: request.host,
            security: request.security,
            ask: request.ask,
            ..PolicyFragment::default()
        };
        if !request_scope.is_empty() {
            scopes.push(request_scope);
        }
        scopes.extend(configured);

        let mut policy = resolve(&scopes);
        policy.elevated = elevated;

        if elevated == Some(ElevatedLevel::Full) {
            policy.security = ExecSecurity::Full;
            policy.ask = ExecAsk::Off;
            tracing::warn!(
                target: "execgate::audit",
                agent_id = %ctx.agent_id,
                provider = ctx.provider.as_deref().unwrap_or("-"),
                sender = ctx.sender.as_deref().unwrap_or("-"),
                command = %request.command,
                "Elevated exec with full bypass: approvals skipped"
            );
        } else if elevated.is_some() {
            tracing::info!(
                target: "execgate::audit",
                agent_id = %ctx.agent_id,
                provider = ctx.provider.as_deref().unwrap_or("-"),
                command = %request.command,
                "Elevated exec routed to gateway host"
            );
        }

        tracing::debug!(
            agent_id = %ctx.agent_id,
            host = %policy.host,
            security = %policy.security,
            ask = %policy.ask,
            ask_fallback = %policy.ask_fallback,
            patterns = policy.allowlist.len(),
            "Resolved exec policy"
        );
        Ok(policy)
    }

    fn check_elevated(&self, ctx: &ExecContext) -> Result<ElevatedLevel> {
        let elevated = &self.config.tools.elevated;
        let mut failing = Vec::new();

        if !elevated.enabled {
            failing.push("enabled (tools.elevated.enabled)".to_string());
        }
        let agent_enabled = self
            .config
            .agent(&ctx.agent_id)
            .and_then(|a| a.tools.elevated.enabled);
        if agent_enabled == Some(false) {
            failing.push(format!(
                "enabled (agents.{}.tools.elevated.enabled)",
                ctx.agent_id
            ));
        }
        if !elevated.allows(ctx.provider.as_deref(), ctx.sender.as_deref()) {
            let provider = ctx.provider.as_deref().unwrap_or("<provider>");
            failing.push(format!("allowFrom (tools.elevated.allow_from.{provider})"));
        }

        if failing.is_empty() {
            return Ok(elevated.level);
        }
        tracing::warn!(
            target: "execgate::audit",
            agent_id = %ctx.agent_id,
            failing = ?failing,
            "Elevated exec refused"
        );
        Err(ExecError::ElevatedUnavailable { failing })
    }
}

/// Folds a node's own approvals file into the gateway policy for that node.
///
/// The node is a separate trust boundary: its allowlist replaces the
/// gateway's, and its policy knobs can only tighten.
pub fn fold_node_policy(
    policy: &EffectivePolicy,
    node_file: &ApprovalsFile,
    agent_id: &str,
) -> EffectivePolicy {
    let mut scopes = node_file.fragments_for(agent_id);
    scopes.push(PolicyFragment {
        scope: Some("gateway".to_string()),
        host: Some(policy.host),
        security: Some(policy.security),
        ask: Some(policy.ask),
        ask_fallback: Some(policy.ask_fallback),
        allowlist: node_file.patterns_for(agent_id),
        safe_bins: Some(policy.safe_bins.iter().cloned().collect()),
    });

    let mut folded = resolve(&scopes);
    folded.elevated = policy.elevated;
    if policy.is_elevated_bypass() {
        folded.security = ExecSecurity::Full;
        folded.ask = ExecAsk::Off;
    }
    folded
}
