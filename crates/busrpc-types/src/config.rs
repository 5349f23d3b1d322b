//! Configuration types.
//!
//! All structs deserialize with `#[serde(default)]` so a partial
//! `config.toml` only overrides what it names.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default call timeout in milliseconds.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 100;

/// Default bound on messages queued for one relay client.
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 1024;

/// Default relay address.
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:6390";

/// Maximum single relay frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Root of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusrpcConfig {
    /// Settings for the local process.
    pub ipc: IpcConfig,
    /// Settings for the TCP relay.
    pub relay: RelayConfig,
}

/// Per-process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// This process's unique id. Random when not configured.
    pub pid: String,
    /// Milliseconds before an unanswered call fails.
    pub call_timeout_ms: u64,
    /// Address of the relay to connect to.
    pub broker_addr: String,
}

impl IpcConfig {
    /// Config with the given pid and defaults for everything else.
    pub fn with_pid(pid: impl Into<String>) -> Self {
        Self {
            pid: pid.into(),
            ..Self::default()
        }
    }

    /// The call timeout as a [`Duration`]. Zero means the default.
    pub fn call_timeout(&self) -> Duration {
        match self.call_timeout_ms {
            0 => Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            ms => Duration::from_millis(ms),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            pid: uuid::Uuid::new_v4().to_string(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            broker_addr: DEFAULT_RELAY_ADDR.to_string(),
        }
    }
}

/// Relay server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind the relay listener on.
    pub listen_addr: String,
    /// Largest frame accepted from a client, in bytes.
    pub max_frame_size: u32,
    /// Messages that may wait for a slow client before it is dropped.
    pub max_pending_messages: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_RELAY_ADDR.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_config_default() {
        let config = IpcConfig::default();
        assert!(!config.pid.is_empty());
        assert_eq!(config.call_timeout_ms, 100);
        assert_eq!(config.call_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_zero_call_timeout_uses_default() {
        let mut config = IpcConfig::with_pid("p1");
        config.call_timeout_ms = 0;
        assert_eq!(
            config.call_timeout(),
            Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_default_pids_are_unique() {
        assert_ne!(IpcConfig::default().pid, IpcConfig::default().pid);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: BusrpcConfig = toml::from_str(
            r#"
            [ipc]
            pid = "worker-1"
            call_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.ipc.pid, "worker-1");
        assert_eq!(config.ipc.call_timeout_ms, 250);
        assert_eq!(config.ipc.broker_addr, DEFAULT_RELAY_ADDR);
        assert_eq!(config.relay.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.relay.max_pending_messages, DEFAULT_MAX_PENDING_MESSAGES);
    }
}
