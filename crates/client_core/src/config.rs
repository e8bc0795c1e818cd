use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use shared::domain::{AgentId, UserId};

use crate::{reveal::RevealOptions, SessionOptions};

pub const DEFAULT_CONFIG_FILE: &str = "oneapp.toml";
const ENV_PREFIX: &str = "ONEAPP";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub user_id: i64,
    pub default_agent_id: Option<i64>,
    pub request_timeout_secs: u64,
    pub reveal_chunk_size: usize,
    pub reveal_interval_ms: u64,
    pub scroll_every_ticks: u32,
    pub thinking_interval_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8787".to_string(),
            user_id: 1,
            default_agent_id: None,
            request_timeout_secs: 30,
            reveal_chunk_size: 3,
            reveal_interval_ms: 30,
            scroll_every_ticks: 5,
            thinking_interval_ms: 1200,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn default_agent(&self) -> Option<AgentId> {
        self.default_agent_id.map(AgentId)
    }

    pub fn reveal_options(&self) -> RevealOptions {
        RevealOptions {
            chunk_size: self.reveal_chunk_size,
            interval: Duration::from_millis(self.reveal_interval_ms),
            scroll_every: self.scroll_every_ticks,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            user_id: UserId(self.user_id),
            reveal: self.reveal_options(),
            thinking_interval: Duration::from_millis(self.thinking_interval_ms.max(1)),
        }
    }
}

/// Loads settings from `path` (required when given) or an optional
/// `oneapp.toml` in the working directory, then `ONEAPP__*` env vars.
pub fn load_client_settings(path: Option<&Path>) -> Result<ClientSettings> {
    let (file, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    Config::builder()
        .add_source(File::from(file.clone()).required(required))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read client settings from {}", file.display()))?
        .try_deserialize()
        .context("invalid client settings")
}
