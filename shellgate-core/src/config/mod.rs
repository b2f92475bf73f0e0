//! Server configuration: compiled defaults, environment overrides, per-server
//! specs, and the YAML servers file.

pub mod defaults;
pub mod error;
pub mod loader;
pub mod schema;

pub use defaults::ProxyDefaults;
pub use error::ConfigError;
pub use loader::{find_config_file, load_and_validate, load_servers_file, substitute_env_vars};
pub use schema::{ServerConfig, ServerSpec, ServersFile, StderrMode};
