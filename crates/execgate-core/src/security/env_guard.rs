//! Host environment validation for the gateway host.

use std::collections::HashMap;

use crate::error::{ExecError, Result};

/// Variables that change how the host loads programs or interpreters.
const BLOCKED_KEYS: &[&str] = &[
    "PATH",
    "NODE_OPTIONS",
    "NODE_PATH",
    "PYTHONPATH",
    "PYTHONHOME",
    "PYTHONSTARTUP",
    "RUBYLIB",
    "RUBYOPT",
    "PERL5LIB",
    "PERL5OPT",
    "BASH_ENV",
    "ENV",
    "GCONV_PATH",
    "IFS",
    "SSLKEYLOGFILE",
    "SHELLOPTS",
    "PS4",
];

const BLOCKED_PREFIXES: &[&str] = &["LD_", "DYLD_", "BASH_FUNC_"];

pub fn is_dangerous_env_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    BLOCKED_KEYS.contains(&upper.as_str())
        || BLOCKED_PREFIXES.iter().any(|p| upper.starts_with(p))
}

/// Rejects the whole map if any key is dangerous or malformed. Must run
/// before the map is merged into a child environment.
pub fn validate_host_env(env: &HashMap<String, String>) -> Result<()> {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    for key in keys {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(ExecError::InvalidRequest(format!(
                "invalid environment variable name '{key}'"
            )));
        }
        if env[key].contains('\0') {
            return Err(ExecError::InvalidRequest(format!(
                "environment variable {key} contains a NUL byte"
            )));
        }
        if is_dangerous_env_key(key) {
            return Err(ExecError::EnvRejected(key.clone()));
        }
    }
    Ok(())
}
