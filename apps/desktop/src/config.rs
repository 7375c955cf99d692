use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use client_core::ClientConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "public_chat.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelSubscription {
    pub server_url: String,
    pub channel_id: i64,
    pub conversation_id: String,
}

#[derive(Debug)]
pub struct Settings {
    pub database_url: String,
    pub identity_label: String,
    pub profile_name: Option<String>,
    pub channels: Vec<ChannelSubscription>,
    pub message_poll_ms: Option<u64>,
    pub deletion_poll_ms: Option<u64>,
    pub channel_poll_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/public_chat.db".into(),
            identity_label: "default".into(),
            profile_name: None,
            channels: Vec::new(),
            message_poll_ms: None,
            deletion_poll_ms: None,
            channel_poll_ms: None,
        }
    }
}

impl Settings {
    pub fn client_config(&self) -> ClientConfig {
        let defaults = ClientConfig::default();
        let interval = |ms: Option<u64>, fallback: Duration| ms.map_or(fallback, Duration::from_millis);
        let message = interval(self.message_poll_ms, defaults.message_poll_interval);
        let deletion = interval(self.deletion_poll_ms, defaults.deletion_poll_interval);
        let channel = interval(self.channel_poll_ms, defaults.channel_poll_interval);
        defaults.with_poll_intervals(message, deletion, channel)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    database_url: Option<String>,
    identity_label: Option<String>,
    profile_name: Option<String>,
    message_poll_ms: Option<u64>,
    deletion_poll_ms: Option<u64>,
    channel_poll_ms: Option<u64>,
    #[serde(default)]
    channels: Vec<ChannelSubscription>,
}

/// Reads `path` (or `public_chat.toml` when present), then applies
/// environment overrides.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

pub fn load_settings_with(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let raw = match path {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?,
        ),
        None => fs::read_to_string(DEFAULT_CONFIG_PATH).ok(),
    };
    if let Some(raw) = raw {
        let file_cfg: FileSettings = toml::from_str(&raw).context("invalid config file")?;
        if let Some(v) = file_cfg.database_url {
            settings.database_url = v;
        }
        if let Some(v) = file_cfg.identity_label {
            settings.identity_label = v;
        }
        settings.profile_name = file_cfg.profile_name;
        settings.message_poll_ms = file_cfg.message_poll_ms;
        settings.deletion_poll_ms = file_cfg.deletion_poll_ms;
        settings.channel_poll_ms = file_cfg.channel_poll_ms;
        settings.channels = file_cfg.channels;
    }

    if let Some(v) = env("PUBLIC_CHAT_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("PUBLIC_CHAT_IDENTITY_LABEL") {
        settings.identity_label = v;
    }
    if let Some(v) = env("PUBLIC_CHAT_PROFILE_NAME") {
        settings.profile_name = Some(v);
    }

    for (key, slot) in [
        ("APP__MESSAGE_POLL_MS", &mut settings.message_poll_ms),
        ("APP__DELETION_POLL_MS", &mut settings.deletion_poll_ms),
        ("APP__CHANNEL_POLL_MS", &mut settings.channel_poll_ms),
    ] {
        if let Some(parsed) = env(key).and_then(|v| v.parse::<u64>().ok()) {
            *slot = Some(parsed);
        }
    }

    let server_url = env("PUBLIC_CHAT_SERVER_URL");
    let channel_id = env("PUBLIC_CHAT_CHANNEL_ID").and_then(|v| v.parse::<i64>().ok());
    if let (Some(server_url), Some(channel_id)) = (server_url, channel_id) {
        let conversation_id = env("PUBLIC_CHAT_CONVERSATION_ID")
            .unwrap_or_else(|| default_conversation_id(&server_url, channel_id));
        settings.channels.push(ChannelSubscription {
            server_url,
            channel_id,
            conversation_id,
        });
    }

    Ok(settings)
}

pub fn default_conversation_id(server_url: &str, channel_id: i64) -> String {
    let host = server_url
        .trim()
        .trim_end_matches('/')
        .rsplit("://")
        .next()
        .unwrap_or_default();
    format!("publicChat:{channel_id}@{host}")
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
