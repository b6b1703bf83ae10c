use std::{collections::HashMap, fs, path::Path, time::Duration as StdDuration};

use anyhow::{anyhow, Result};
use chrono::Duration;
use serde::Deserialize;
use url::Url;

use crate::transport::Backoff;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub tenant_slug: String,
    pub database_url: String,
    pub session_token: Option<String>,
    pub backup_session_path: String,
    pub retention_minutes: i64,
    pub history_limit: u32,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3001".into(),
            tenant_slug: "demo".into(),
            database_url: "sqlite://./data/chat_cache.db".into(),
            session_token: None,
            backup_session_path: "/api/debug-session".into(),
            retention_minutes: 180,
            history_limit: 100,
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 5_000,
            sweep_interval_secs: 300,
        }
    }
}

impl ClientSettings {
    pub fn retention(&self) -> Duration {
        Duration::minutes(self.retention_minutes.max(1))
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            StdDuration::from_millis(self.reconnect_min_ms),
            StdDuration::from_millis(self.reconnect_max_ms.max(self.reconnect_min_ms)),
        )
    }

    /// Websocket endpoint derived from the http(s) server url.
    pub fn websocket_url(&self) -> Result<String> {
        let mut url = Url::parse(self.server_url.trim_end_matches('/'))
            .map_err(|err| anyhow!("invalid server_url '{}': {err}", self.server_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(anyhow!(
                    "server_url must start with http:// or https://, got {other}://"
                ))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from '{}'", self.server_url))?;
        url.set_path("/ws");
        url.query_pairs_mut()
            .clear()
            .append_pair("tenantSlug", &self.tenant_slug);
        Ok(url.to_string())
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        apply_file_overrides(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.database_url = normalize_database_url(&settings.database_url);

    settings
}

pub(crate) fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    let text = |key: &str| file_cfg.get(key).map(value_to_string);

    if let Some(v) = text("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = text("tenant_slug") {
        settings.tenant_slug = v;
    }
    if let Some(v) = text("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = text("session_token") {
        settings.session_token = Some(v);
    }
    if let Some(v) = text("backup_session_path") {
        settings.backup_session_path = v;
    }
    if let Some(v) = text("retention_minutes").and_then(|v| v.parse().ok()) {
        settings.retention_minutes = v;
    }
    if let Some(v) = text("history_limit").and_then(|v| v.parse().ok()) {
        settings.history_limit = v;
    }
    if let Some(v) = text("reconnect_min_ms").and_then(|v| v.parse().ok()) {
        settings.reconnect_min_ms = v;
    }
    if let Some(v) = text("reconnect_max_ms").and_then(|v| v.parse().ok()) {
        settings.reconnect_max_ms = v;
    }
    if let Some(v) = text("sweep_interval_secs").and_then(|v| v.parse().ok()) {
        settings.sweep_interval_secs = v;
    }
}

pub(crate) fn apply_env_overrides(
    settings: &mut ClientSettings,
    var: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = var("CHAT_TENANT_SLUG") {
        settings.tenant_slug = v;
    }
    if let Some(v) = var("APP__TENANT_SLUG") {
        settings.tenant_slug = v;
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("CHAT_SESSION_TOKEN") {
        settings.session_token = Some(v);
    }
    if let Some(v) = var("APP__BACKUP_SESSION_PATH") {
        settings.backup_session_path = v;
    }

    if let Some(v) = var("APP__RETENTION_MINUTES").and_then(|v| v.parse().ok()) {
        settings.retention_minutes = v;
    }
    if let Some(v) = var("APP__HISTORY_LIMIT").and_then(|v| v.parse().ok()) {
        settings.history_limit = v;
    }
    if let Some(v) = var("APP__RECONNECT_MIN_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_min_ms = v;
    }
    if let Some(v) = var("APP__RECONNECT_MAX_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_max_ms = v;
    }
    if let Some(v) = var("APP__SWEEP_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        settings.sweep_interval_secs = v;
    }
}

fn value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
