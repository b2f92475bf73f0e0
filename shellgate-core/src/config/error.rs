//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Servers-file loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No servers defined in the file.
    #[error("no servers defined in configuration")]
    NoServersDefined,

    /// Two servers in one file share a name.
    #[error("duplicate server name: '{name}'")]
    DuplicateServerName { name: String },

    /// Unsupported schema version.
    #[error("unsupported schema version: {version} (expected 1)")]
    UnsupportedSchemaVersion { version: u32 },

    /// Required environment variable not set.
    #[error("required environment variable '{var}' not set (referenced in {field})")]
    MissingEnvVar { var: String, field: String },

    /// Config file is empty.
    #[error("configuration file is empty")]
    EmptyConfigFile,

    /// Config file not found.
    #[error("configuration file not found: {path}")]
    ConfigFileNotFound { path: PathBuf },

    /// No config file found in any search location.
    #[error("no configuration file found (searched: {searched})")]
    NoConfigFile { searched: String },

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::DuplicateServerName {
            name: "main".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate server name: 'main'");

        let err = ConfigError::MissingEnvVar {
            var: "PORT".to_string(),
            field: "configuration".to_string(),
        };
        assert!(err.to_string().contains("'PORT'"));
    }
}
