//! Configuration loading from `~/.busrpc/config.toml` with defaults.

use busrpc_types::BusrpcConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load configuration from a TOML file, with defaults.
///
/// A missing, unreadable or malformed file yields the defaults; the reason
/// is logged.
pub fn load_config(path: Option<&Path>) -> BusrpcConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return BusrpcConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return BusrpcConfig::default();
        }
    };

    match toml::from_str::<BusrpcConfig>(&contents) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            BusrpcConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    busrpc_home().join("config.toml")
}

/// Get the default busrpc home directory.
pub fn busrpc_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".busrpc")
}
