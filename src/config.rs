//! Configuration loading for the crossbar binary.
//!
//! Reads `crossbar.yaml` when present; otherwise falls back to defaults
//! with the `LISTEN` environment variable overriding the listen address.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::server::{DEFAULT_MAX_SERVICE_MEMORY_PER_CORE, ServerConfig};

const CONFIG_FILE: &str = "crossbar.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,
    #[serde(default = "default_max_memory")]
    pub max_service_memory_per_core: usize,
    #[serde(default)]
    pub disable_metrics: bool,
}

fn default_listen_addrs() -> Vec<String> {
    vec!["127.0.0.1:9090".to_string()]
}

fn default_max_memory() -> usize {
    DEFAULT_MAX_SERVICE_MEMORY_PER_CORE
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            max_service_memory_per_core: default_max_memory(),
            disable_metrics: false,
        }
    }
}

impl Config {
    /// Loads `crossbar.yaml` from the working directory when it exists,
    /// otherwise defaults with the `LISTEN` environment override. A config
    /// file always wins over the environment.
    pub fn load() -> Self {
        if Path::new(CONFIG_FILE).exists() {
            match Self::load_from_file(CONFIG_FILE) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load config file, using defaults");
                }
            }
        }
        let mut cfg = Self {
            server: ServerSection::default(),
        };
        if let Ok(listen) = std::env::var("LISTEN") {
            cfg.server.listen_addrs = vec![listen];
        }
        cfg
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Builds the server configuration. TLS credentials are not part of
    /// the file format and are attached by the caller.
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let addrs = self
            .server
            .listen_addrs
            .iter()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid listen address {addr}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ServerConfig {
            addrs,
            credentials: None,
            max_service_memory_per_core: self.server.max_service_memory_per_core,
            disable_metrics: self.server.disable_metrics,
        })
    }
}
