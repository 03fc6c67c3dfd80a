//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tinycam_core::config::{Codec, EncoderConfig};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to bind the HTTP/WebSocket server to.
    pub bind_addr: IpAddr,

    /// Port to bind the HTTP/WebSocket server to.
    /// Override: `TINYCAM_BIND_PORT`
    pub bind_port: u16,

    /// Encoder invocation: codec, resolution, device, tuning flags.
    pub encoder: EncoderConfig,

    /// Directory holding the key file and device lock files.
    /// Override: `TINYCAM_DATA_DIR`
    pub data_dir: PathBuf,

    /// Default per-subscriber/session outbound queue capacity (clamped to
    /// `[2, 4096]` by `tinycam_core::queue`).
    pub queue_capacity: usize,

    /// Seconds allowed for the client to send its `start` frame.
    pub start_timeout_secs: u64,

    /// Seconds of inbound-frame inactivity before a streaming session is
    /// closed with a policy-violation status.
    pub inactivity_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            bind_port: 9191,
            encoder: EncoderConfig {
                encoder_binary: "ffmpeg".to_string(),
                device_id: "/dev/video0".to_string(),
                codec: Codec::H264,
                width: 1280,
                height: 720,
                fps: 30,
                extra_args: Vec::new(),
            },
            data_dir: PathBuf::from("./data"),
            queue_capacity: tinycam_core::queue::DEFAULT_CAPACITY,
            start_timeout_secs: 60,
            inactivity_timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides. Falls back to defaults if no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TINYCAM_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
        if let Ok(val) = std::env::var("TINYCAM_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
    }

    /// Path to the at-rest key material file.
    #[must_use]
    pub fn key_file_path(&self) -> PathBuf {
        self.data_dir.join("keys.json")
    }

    /// Directory holding device-arbitration lock files.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_timeouts() {
        let config = ServerConfig::default();
        assert_eq!(config.start_timeout_secs, 60);
        assert_eq!(config.inactivity_timeout_secs, 60);
    }

    #[test]
    fn key_and_lock_paths_are_under_data_dir() {
        let mut config = ServerConfig::default();
        config.data_dir = PathBuf::from("/tmp/tinycam-data");
        assert_eq!(
            config.key_file_path(),
            PathBuf::from("/tmp/tinycam-data/keys.json")
        );
        assert_eq!(config.lock_dir(), PathBuf::from("/tmp/tinycam-data/locks"));
    }
}
