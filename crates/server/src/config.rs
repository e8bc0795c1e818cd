use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub default_agent_name: String,
    pub default_agent_model: String,
    pub default_agent_provider: String,
    pub default_agent_avatar_url: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8787".into(),
            database_url: "sqlite://./data/oneapp.db".into(),
            default_agent_name: "OneApp Assistant".into(),
            default_agent_model: "echo-1".into(),
            default_agent_provider: "local".into(),
            default_agent_avatar_url: None,
            max_body_bytes: 64 * 1024,
        }
    }
}

pub fn load_settings() -> Settings {
    let file_cfg = fs::read_to_string("server.toml")
        .ok()
        .and_then(|raw| toml::from_str::<HashMap<String, String>>(&raw).ok())
        .unwrap_or_default();
    let env: HashMap<String, String> = std::env::vars().collect();
    resolve_settings(&file_cfg, &env)
}

/// File values override defaults; environment overrides both. `APP__*` names
/// win over the short names when both are present.
fn resolve_settings(
    file_cfg: &HashMap<String, String>,
    env: &HashMap<String, String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(v) = file_cfg.get("bind_addr") {
        settings.server_bind = v.clone();
    }
    if let Some(v) = file_cfg.get("database_url") {
        settings.database_url = v.clone();
    }
    if let Some(v) = file_cfg.get("default_agent_name") {
        settings.default_agent_name = v.clone();
    }
    if let Some(v) = file_cfg.get("default_agent_model") {
        settings.default_agent_model = v.clone();
    }
    if let Some(v) = file_cfg.get("default_agent_provider") {
        settings.default_agent_provider = v.clone();
    }
    if let Some(v) = file_cfg.get("default_agent_avatar_url") {
        settings.default_agent_avatar_url = Some(v.clone());
    }

    let lookup = |short: &str, long: &str| env.get(long).or_else(|| env.get(short)).cloned();

    if let Some(v) = lookup("SERVER_BIND", "APP__BIND_ADDR") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("DATABASE_URL", "APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("DEFAULT_AGENT_NAME", "APP__DEFAULT_AGENT_NAME") {
        settings.default_agent_name = v;
    }
    if let Some(v) = lookup("DEFAULT_AGENT_MODEL", "APP__DEFAULT_AGENT_MODEL") {
        settings.default_agent_model = v;
    }
    if let Some(v) = lookup("DEFAULT_AGENT_PROVIDER", "APP__DEFAULT_AGENT_PROVIDER") {
        settings.default_agent_provider = v;
    }
    if let Some(v) = lookup("DEFAULT_AGENT_AVATAR_URL", "APP__DEFAULT_AGENT_AVATAR_URL") {
        settings.default_agent_avatar_url = Some(v);
    }
    if let Some(parsed) = env
        .get("APP__MAX_BODY_BYTES")
        .and_then(|v| v.parse::<usize>().ok())
    {
        settings.max_body_bytes = parsed;
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
