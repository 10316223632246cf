pub mod analyze;
pub mod approvals;
pub mod run;

use std::collections::HashMap;

use execgate_core::{ExecContext, ExecRequest};

use crate::cli::PolicyArgs;

pub(crate) fn build_request(command: &[String], policy: &PolicyArgs) -> ExecRequest {
    ExecRequest {
        command: command.join(" "),
        workdir: policy.workdir.clone(),
        env: policy.env.iter().cloned().collect::<HashMap<_, _>>(),
        host: policy.host,
        security: policy.security,
        ask: policy.ask,
        ..ExecRequest::default()
    }
}

pub(crate) fn context(policy: &PolicyArgs) -> ExecContext {
    ExecContext::new(policy.agent.clone()).with_provider("cli", None)
}
