use std::path::{Path, PathBuf};

use anyhow::Result;
use execgate_core::ExecGateConfig;

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".execgate").join("config.toml"))
}

/// Loads the explicit config, else the default file if present, else the
/// built-in defaults.
pub fn load(explicit: Option<&Path>) -> Result<ExecGateConfig> {
    if let Some(path) = explicit {
        return ExecGateConfig::load(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => ExecGateConfig::load(&path),
        _ => {
            tracing::debug!("No config file found, using defaults");
            Ok(ExecGateConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_explicit_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tools.exec]\nhost = \"gateway\"\nsecurity = \"full\"\n").unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(
            config.exec().policy.security,
            Some(execgate_traits::ExecSecurity::Full)
        );
    }
}
