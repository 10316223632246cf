use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Operating system family of an execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Unix,
    Windows,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }
}

/// Where a command is analyzed for. Only a local target can consult the
/// filesystem and `PATH`; a remote one resolves absolute paths only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub family: OsFamily,
    pub local: bool,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            family: OsFamily::current(),
            local: true,
        }
    }

    /// A paired node, from its reported platform (`win32`, `darwin`, `linux`…).
    pub fn remote(platform: Option<&str>) -> Self {
        let family = match platform.map(|p| p.trim().to_ascii_lowercase()) {
            Some(p) if p.starts_with("win") => OsFamily::Windows,
            Some(_) => OsFamily::Unix,
            None => OsFamily::current(),
        };
        Self {
            family,
            local: false,
        }
    }

    pub fn is_native(&self) -> bool {
        self.local && self.family == OsFamily::current()
    }

    pub fn is_windows(&self) -> bool {
        self.family == OsFamily::Windows
    }

    pub fn has_separator(&self, token: &str) -> bool {
        token.contains('/') || (self.is_windows() && token.contains('\\'))
    }

    fn is_absolute(&self, token: &str) -> bool {
        match self.family {
            OsFamily::Unix => token.starts_with('/'),
            OsFamily::Windows => {
                let bytes = token.as_bytes();
                token.starts_with("\\\\")
                    || (bytes.len() >= 3
                        && bytes[0].is_ascii_alphabetic()
                        && bytes[1] == b':'
                        && (bytes[2] == b'\\' || bytes[2] == b'/'))
            }
        }
    }

    /// Lower-cased, `.exe`-stripped on Windows.
    pub fn normalize_name(&self, name: &str) -> String {
        match self.family {
            OsFamily::Unix => name.to_string(),
            OsFamily::Windows => {
                let lower = name.to_ascii_lowercase();
                lower
                    .strip_suffix(".exe")
                    .map(str::to_string)
                    .unwrap_or(lower)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandResolution {
    pub resolved_path: Option<PathBuf>,
    pub executable_name: String,
    /// The token named a path rather than a bare program name.
    pub explicit_path: bool,
}

impl CommandResolution {
    pub fn resolve(
        token: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        platform: Platform,
    ) -> Self {
        let explicit_path = platform.has_separator(token) || token.starts_with('~');
        let resolved = if !platform.is_native() {
            platform
                .is_absolute(token)
                .then(|| PathBuf::from(token))
        } else if explicit_path {
            let path = expand_home(token);
            if path.is_absolute() {
                Some(path).filter(|p| is_executable(p))
            } else {
                cwd.join(path).canonicalize().ok().filter(|p| is_executable(p))
            }
        } else {
            let search: Option<OsString> = env
                .get("PATH")
                .map(OsString::from)
                .or_else(|| std::env::var_os("PATH"));
            which::which_in(token, search, cwd).ok()
        };

        let raw_name = token
            .rsplit(|c| c == '/' || (platform.is_windows() && c == '\\'))
            .next()
            .unwrap_or(token);
        let executable_name = resolved
            .as_ref()
            .filter(|_| platform.is_native())
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| raw_name.to_string());

        Self {
            resolved_path: resolved,
            executable_name: platform.normalize_name(&executable_name),
            explicit_path,
        }
    }
}

/// Patterns with a path separator are globbed against the resolved path;
/// bare patterns against the program name, and only when the command named
/// the program without a path.
pub fn matches_path_pattern(
    pattern: &str,
    resolution: &CommandResolution,
    platform: Platform,
) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }

    if platform.has_separator(pattern) || pattern.starts_with('~') {
        let Some(resolved) = resolution.resolved_path.as_ref() else {
            return false;
        };
        let pattern = normalize_for_match(&expand_home(pattern).to_string_lossy(), platform);
        let mut candidates = vec![resolved.clone()];
        if platform.is_native()
            && let Ok(canonical) = resolved.canonicalize()
            && canonical != *resolved
        {
            candidates.push(canonical);
        }
        return candidates.iter().any(|candidate| {
            glob_match::glob_match(
                &pattern,
                &normalize_for_match(&candidate.to_string_lossy(), platform),
            )
        });
    }

    if resolution.explicit_path {
        return false;
    }
    glob_match::glob_match(
        &platform.normalize_name(pattern),
        &resolution.executable_name,
    )
}

fn normalize_for_match(value: &str, platform: Platform) -> String {
    if platform.is_windows() {
        value.replace('\\', "/").to_ascii_lowercase()
    } else {
        value.to_string()
    }
}

/// Expands a leading `~` or `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
