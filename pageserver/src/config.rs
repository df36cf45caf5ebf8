use crate::cli::Args;
use ps_core::{DATA_PAGE_SIZE, PageServerError, Result};
use ps_network::DEFAULT_MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    /// Time a new connection has to send its role handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Frames with a larger payload are a protocol error
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    #[serde(default)]
    pub responder: ResponderSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub replication: ReplicationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderSettings {
    /// Requests executing concurrently on the blocking pool
    pub max_in_flight: usize,
    /// Time shutdown waits for outstanding requests
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub perm_volume_count: i32,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    pub parallel_count: usize,
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3300"
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3300))),
            metrics_addr: "0.0.0.0:9100"
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9100))),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_payload_size: default_max_payload_size(),
            responder: ResponderSettings::default(),
            storage: StorageSettings::default(),
            replication: ReplicationSettings::default(),
        }
    }
}

impl Default for ResponderSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            drain_timeout_secs: 10,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            perm_volume_count: 1,
            page_size: DATA_PAGE_SIZE,
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self { parallel_count: 4 }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Self = match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| PageServerError::Config(format!("TOML parse error: {}", e)))?,
            "json" => serde_json::from_str(&content)
                .map_err(|e| PageServerError::Config(format!("JSON parse error: {}", e)))?,
            _ => {
                return Err(PageServerError::Config(format!(
                    "Unknown config file extension: {}",
                    ext
                )));
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_args(args: &Args) -> Self {
        Self {
            listen_addr: args.listen,
            metrics_addr: args.metrics,
            handshake_timeout_ms: args.handshake_timeout_ms,
            responder: ResponderSettings {
                max_in_flight: args.responder_max_in_flight,
                ..Default::default()
            },
            storage: StorageSettings {
                perm_volume_count: args.perm_volume_count,
                ..Default::default()
            },
            replication: ReplicationSettings {
                parallel_count: args.replication_parallel_count,
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.perm_volume_count < 0 {
            return Err(PageServerError::Config(format!(
                "storage.perm_volume_count must not be negative, got {}",
                self.storage.perm_volume_count
            )));
        }
        if self.storage.page_size == 0 {
            return Err(PageServerError::Config("storage.page_size must be positive".into()));
        }
        if self.responder.max_in_flight == 0 {
            return Err(PageServerError::Config(
                "responder.max_in_flight must be at least 1".into(),
            ));
        }
        if self.max_payload_size == 0 {
            return Err(PageServerError::Config("max_payload_size must be positive".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.responder.drain_timeout_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 3300);
        assert_eq!(config.metrics_addr.port(), 9100);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_payload_size, 16 * 1024 * 1024);
        assert_eq!(config.storage.page_size, DATA_PAGE_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_section_defaults() {
        let responder = ResponderSettings::default();
        assert_eq!(responder.max_in_flight, 64);
        assert_eq!(responder.drain_timeout_secs, 10);

        assert_eq!(StorageSettings::default().perm_volume_count, 1);
        assert_eq!(ReplicationSettings::default().parallel_count, 4);
    }

    #[test]
    fn test_config_from_toml_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("pageserver.toml");

        let toml_content = r#"
listen_addr = "127.0.0.1:4400"
metrics_addr = "127.0.0.1:9200"
handshake_timeout_ms = 250

[responder]
max_in_flight = 8
drain_timeout_secs = 3

[storage]
perm_volume_count = 3
page_size = 4096

[replication]
parallel_count = 2
"#;

        std::fs::write(&config_path, toml_content).unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.listen_addr.port(), 4400);
        assert_eq!(config.handshake_timeout_ms, 250);
        assert_eq!(config.responder.max_in_flight, 8);
        assert_eq!(config.drain_timeout(), Duration::from_secs(3));
        assert_eq!(config.storage.perm_volume_count, 3);
        assert_eq!(config.storage.page_size, 4096);
        assert_eq!(config.replication.parallel_count, 2);
        // Omitted keys fall back to defaults
        assert_eq!(config.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("pageserver.json");

        let json_content = r#"{
            "listen_addr": "127.0.0.1:4401",
            "metrics_addr": "127.0.0.1:9201",
            "storage": {"perm_volume_count": 5, "page_size": 16384}
        }"#;

        std::fs::write(&config_path, json_content).unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.listen_addr.port(), 4401);
        assert_eq!(config.storage.perm_volume_count, 5);
        assert_eq!(config.responder.max_in_flight, 64);
    }

    #[test]
    fn test_config_unknown_extension() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("pageserver.yaml");
        std::fs::write(&config_path, "listen_addr: 127.0.0.1:1").unwrap();

        let result = Config::from_file(&config_path);
        assert!(matches!(result, Err(PageServerError::Config(_))));
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("pageserver.toml");
        std::fs::write(
            &config_path,
            r#"
listen_addr = "127.0.0.1:4400"
metrics_addr = "127.0.0.1:9200"

[responder]
max_in_flight = 0
drain_timeout_secs = 1
"#,
        )
        .unwrap();

        assert!(matches!(
            Config::from_file(&config_path),
            Err(PageServerError::Config(_))
        ));
    }

    #[test]
    fn test_config_from_args() {
        let args = Args::parse_from([
            "pageserver",
            "--listen",
            "127.0.0.1:5500",
            "--perm-volume-count",
            "7",
            "--replication-parallel-count",
            "3",
        ]);

        let config = Config::from_args(&args);
        assert_eq!(config.listen_addr.port(), 5500);
        assert_eq!(config.storage.perm_volume_count, 7);
        assert_eq!(config.replication.parallel_count, 3);
        assert_eq!(config.responder.max_in_flight, 64);
    }
}
