//! Configuration for the filtra node binary.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network settings shared by every role.
    pub network: NetworkConfig,
    /// Worker-role settings.
    pub worker: WorkerConfig,
    /// Client-role settings.
    pub client: ClientConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address of the dispatcher (workers and clients connect here).
    pub dispatcher_ip: String,
    /// UDP port the dispatcher listens on.
    pub dispatcher_port: u16,
    /// UDP port to bind for this node (0 = OS-assigned).
    pub listen_port: u16,
}

/// Worker-role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Median filter window size; odd values only.
    pub filter_window: usize,
    /// IP announced to the dispatcher at registration.
    pub advertised_ip: String,
}

/// Client-role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory of images to submit.
    pub input_dir: String,
    /// Directory filtered results are written to.
    pub output_dir: String,
    /// Delay between consecutive submissions, in milliseconds.
    pub send_interval_ms: u64,
    /// Give up waiting for results after this many seconds.
    pub result_timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            worker: WorkerConfig::default(),
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dispatcher_ip: "127.0.0.1".into(),
            dispatcher_port: 9000,
            listen_port: 0,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            filter_window: filtra_core::DEFAULT_WINDOW,
            advertised_ip: "127.0.0.1".into(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            input_dir: "images".into(),
            output_dir: "filtered".into(),
            send_interval_ms: 100,
            result_timeout_secs: 120,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = NodeConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("dispatcher_port"));
        assert!(text.contains("filter_window"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = NodeConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.dispatcher_port, 9000);
        assert_eq!(parsed.worker.filter_window, filtra_core::DEFAULT_WINDOW);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: NodeConfig = toml::from_str("[network]\ndispatcher_port = 9500\n").unwrap();
        assert_eq!(parsed.network.dispatcher_port, 9500);
        assert_eq!(parsed.network.dispatcher_ip, "127.0.0.1");
        assert_eq!(parsed.client.send_interval_ms, 100);
    }
}
