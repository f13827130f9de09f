//! Configuration management for the hub
//!
//! Layered: defaults, then an optional `pipehub.toml`, then environment
//! variables. Workers and CLIs read the same `PIPELINE_*` variables to find
//! the hub.

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main hub configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HubConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Address workers advertise for the hub to reach back (reserved)
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Metadata store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Durable transaction queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Blob bucket configuration
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 65432,
        }
    }
}

/// Worker-side address book entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 65433,
        }
    }
}

/// Metadata store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path (relative paths land under the data dir)
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pipehub.db"),
        }
    }
}

/// Durable transaction queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Spool directory for queued mutations
    pub path: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("queue"),
        }
    }
}

/// Blob bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Backend selector: "fs" or "memory"
    pub backend: String,

    /// Root directory for the "fs" backend
    pub path: PathBuf,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            backend: "fs".to_string(),
            path: PathBuf::from("bucket"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl HubConfig {
    /// Load configuration.
    ///
    /// Priority order:
    /// 1. Default values
    /// 2. `pipehub.toml` (or an explicit `--config` path)
    /// 3. Environment variables
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new("pipehub.toml");
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HubError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&contents)
            .map_err(|e| HubError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Apply the `PIPELINE_*` / `PIPE_WORKER_*` / `PIPEHUB_*` overrides.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("PIPELINE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("PIPELINE_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(host) = std::env::var("PIPE_WORKER_HOST") {
            self.worker.host = host;
        }
        if let Ok(port) = std::env::var("PIPE_WORKER_PORT") {
            if let Ok(port) = port.parse() {
                self.worker.port = port;
            }
        }
        if let Ok(backend) = std::env::var("PIPEHUB_BUCKET") {
            self.bucket.backend = backend;
        }
        if let Ok(data_dir) = std::env::var("PIPEHUB_DATA_DIR") {
            self.anchor_paths(Path::new(&data_dir));
        }
    }

    /// Re-root every relative storage path under `data_dir`.
    pub fn anchor_paths(&mut self, data_dir: &Path) {
        for path in [
            &mut self.database.path,
            &mut self.queue.path,
            &mut self.bucket.path,
        ] {
            if path.is_relative() {
                *path = data_dir.join(path.as_path());
            }
        }
    }

    /// Default data directory when none is given: `~/.pipehub`.
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pipehub")
    }

    /// Listener address string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 65432);
        assert_eq!(config.bucket.backend, "fs");
        assert_eq!(config.server_addr(), "127.0.0.1:65432");
    }

    #[test]
    fn test_parse_partial_file() {
        let config: HubConfig = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [bucket]
            backend = "memory"
            path = "unused"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.bucket.backend, "memory");
        // Untouched sections keep their defaults.
        assert_eq!(config.database.path, PathBuf::from("pipehub.db"));
    }

    #[test]
    fn test_anchor_paths_leaves_absolute_paths() {
        let mut config = HubConfig::default();
        config.database.path = PathBuf::from("/var/lib/hub.db");
        config.anchor_paths(Path::new("/data"));

        assert_eq!(config.database.path, PathBuf::from("/var/lib/hub.db"));
        assert_eq!(config.queue.path, PathBuf::from("/data/queue"));
        assert_eq!(config.bucket.path, PathBuf::from("/data/bucket"));
    }
}
