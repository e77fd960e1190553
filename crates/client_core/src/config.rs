use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use protocol::domain::Identity;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "orchestrator-client.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub orchestrator_path: String,
    pub adjacency_path: String,
    pub stream_path: String,
    pub tenant_id: String,
    pub user_id: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub stream: StreamConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            orchestrator_path: "/api/orchestrator".into(),
            adjacency_path: "/api/orchestrator/adjacency".into(),
            stream_path: "/api/orchestrator/stream".into(),
            tenant_id: "default".into(),
            user_id: "anonymous".into(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            stream: StreamConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn identity(&self) -> Identity {
        Identity::new(self.tenant_id.as_str(), self.user_id.as_str())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub max_events: usize,
    pub reconnect_delay_ms: u64,
    pub auto_reconnect: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            reconnect_delay_ms: 3000,
            auto_reconnect: true,
        }
    }
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Loads the client configuration: defaults, then the TOML file (an explicit
/// path must exist; the default file is optional), then environment
/// overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            read_config_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => ClientConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

pub fn parse_config(raw: &str) -> anyhow::Result<ClientConfig> {
    toml::from_str(raw).context("invalid client configuration")
}

fn read_config_file(path: &Path) -> anyhow::Result<ClientConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    parse_config(&raw).with_context(|| format!("failed to parse config file '{}'", path.display()))
}

fn apply_env_overrides(config: &mut ClientConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("ORCHESTRATOR_URL") {
        config.base_url = v;
    }
    if let Some(v) = lookup("APP__BASE_URL") {
        config.base_url = v;
    }

    if let Some(v) = lookup("ORCHESTRATOR_TENANT_ID") {
        config.tenant_id = v;
    }
    if let Some(v) = lookup("APP__TENANT_ID") {
        config.tenant_id = v;
    }

    if let Some(v) = lookup("ORCHESTRATOR_USER_ID") {
        config.user_id = v;
    }
    if let Some(v) = lookup("APP__USER_ID") {
        config.user_id = v;
    }

    if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS") {
        match v.parse() {
            Ok(parsed) => config.request_timeout_secs = parsed,
            Err(_) => warn!(value = %v, "config: ignoring invalid APP__REQUEST_TIMEOUT_SECS"),
        }
    }
    if let Some(v) = lookup("APP__STREAM_MAX_EVENTS") {
        match v.parse() {
            Ok(parsed) => config.stream.max_events = parsed,
            Err(_) => warn!(value = %v, "config: ignoring invalid APP__STREAM_MAX_EVENTS"),
        }
    }
    if let Some(v) = lookup("APP__STREAM_RECONNECT_DELAY_MS") {
        match v.parse() {
            Ok(parsed) => config.stream.reconnect_delay_ms = parsed,
            Err(_) => warn!(value = %v, "config: ignoring invalid APP__STREAM_RECONNECT_DELAY_MS"),
        }
    }
}
