//! Servers-file discovery, loading and validation.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::error::ConfigError;
use super::schema::ServersFile;

/// File name looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "shellgate.yaml";

/// Environment variable naming the servers file.
pub const CONFIG_ENV_VAR: &str = "SHELLGATE_CONFIG";

/// Configuration file search paths (in priority order, after an explicit path).
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        paths.push(PathBuf::from(path));
    }

    paths.push(PathBuf::from(".").join(DEFAULT_CONFIG_FILE));

    paths
}

/// Find the servers file: explicit path, then `SHELLGATE_CONFIG`, then
/// `./shellgate.yaml`.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::ConfigFileNotFound {
            path: path.to_path_buf(),
        });
    }

    let candidates = default_config_paths();
    if let Some(found) = candidates.iter().find(|p| p.exists()) {
        return Ok(found.clone());
    }

    Err(ConfigError::NoConfigFile {
        searched: candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Read, substitute and parse a servers file without validating it.
pub fn load_servers_file(path: &Path) -> Result<ServersFile, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_servers_file(&contents)
}

/// Substitute and parse servers-file text.
pub fn parse_servers_file(contents: &str) -> Result<ServersFile, ConfigError> {
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(contents)?;
    let file: ServersFile = serde_saphyr::from_str(&contents)?;
    Ok(file)
}

/// Load and validate a servers file.
pub fn load_and_validate(path: &Path) -> Result<ServersFile, ConfigError> {
    let file = load_servers_file(path)?;
    validate(&file)?;
    Ok(file)
}

/// File-level validation. Per-server checks happen in
/// [`ServerSpec::validate`](super::ServerSpec::validate) when each server
/// is started.
pub fn validate(file: &ServersFile) -> Result<(), ConfigError> {
    if file.schema != 1 {
        return Err(ConfigError::UnsupportedSchemaVersion {
            version: file.schema,
        });
    }

    if file.servers.is_empty() {
        return Err(ConfigError::NoServersDefined);
    }

    let mut seen = HashSet::new();
    for name in file.servers.iter().filter_map(|s| s.name.as_deref()) {
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateServerName {
                name: name.to_string(),
            });
        }
    }

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on LazyLock with a compile-time literal regex pattern.
// The pattern is known-valid and tested by test_env_var_pattern_compiles().
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute environment variables in a string.
///
/// # Syntax
/// - `${VAR}` - Required, fail if not set
/// - `${VAR:-default}` - Optional with default
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = cap.get(1).map_or("", |m| m.as_str());
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }

    Ok(result.into_owned())
}
