use std::{fs, path::Path, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};

use shared::constants::{
    INITIAL_PAGE_SIZE, MAX_MESSAGE_LENGTH, OFFLINE_MAX_RETRIES, OLDER_PAGE_SIZE,
    RECONCILE_WINDOW_MS, RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_DELAY_MS,
    RETAINED_MESSAGES_ON_SWITCH, TYPING_COLLAPSE_THRESHOLD, TYPING_EXPIRY_MS,
    VISIBILITY_REFRESH_AFTER_SECS,
};

use crate::transport::BackoffPolicy;

pub const SETTINGS_FILE: &str = "chat_client.toml";
pub const TOMBSTONE_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub api_url: String,
    /// Derived from `api_url` when unset.
    pub realtime_url: Option<String>,
    pub database_url: String,
    pub initial_page_size: u32,
    pub older_page_size: u32,
    pub retained_messages_on_switch: usize,
    pub reconcile_window_ms: i64,
    pub typing_expiry_ms: u64,
    pub typing_collapse_threshold: usize,
    pub visibility_refresh_after_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub offline_max_retries: u32,
    pub max_message_length: usize,
    pub tombstone_ttl_days: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:54321".into(),
            realtime_url: None,
            database_url: "sqlite://./data/chat_client.db".into(),
            initial_page_size: INITIAL_PAGE_SIZE,
            older_page_size: OLDER_PAGE_SIZE,
            retained_messages_on_switch: RETAINED_MESSAGES_ON_SWITCH,
            reconcile_window_ms: RECONCILE_WINDOW_MS,
            typing_expiry_ms: TYPING_EXPIRY_MS,
            typing_collapse_threshold: TYPING_COLLAPSE_THRESHOLD,
            visibility_refresh_after_secs: VISIBILITY_REFRESH_AFTER_SECS,
            reconnect_base_delay_ms: RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: RECONNECT_MAX_DELAY_MS,
            reconnect_max_attempts: RECONNECT_MAX_ATTEMPTS,
            offline_max_retries: OFFLINE_MAX_RETRIES,
            max_message_length: MAX_MESSAGE_LENGTH,
            tombstone_ttl_days: TOMBSTONE_TTL_DAYS,
        }
    }
}

impl EngineSettings {
    pub fn realtime_url(&self) -> String {
        if let Some(url) = &self.realtime_url {
            return url.clone();
        }
        let base = self.api_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/realtime")
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.reconnect_base_delay_ms),
            max: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn reconcile_window(&self) -> TimeDelta {
        TimeDelta::try_milliseconds(self.reconcile_window_ms)
            .unwrap_or_else(|| TimeDelta::milliseconds(RECONCILE_WINDOW_MS))
    }

    /// `None` when the TTL does not fit the calendar; nothing is purged then.
    pub fn tombstone_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        TimeDelta::try_days(self.tombstone_ttl_days).and_then(|ttl| now.checked_sub_signed(ttl))
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn visibility_refresh_after(&self) -> Duration {
        Duration::from_secs(self.visibility_refresh_after_secs)
    }
}

pub fn load_settings() -> EngineSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the flat scalar keys of `path` if it parses, then the environment.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> EngineSettings {
    let mut settings = EngineSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<toml::Table>(&raw) {
            for (key, value) in &file_cfg {
                let value = match value {
                    toml::Value::String(text) => text.clone(),
                    toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Boolean(_) => {
                        value.to_string()
                    }
                    _ => continue,
                };
                apply_setting(&mut settings, key, &value);
            }
        }
    }

    for key in SETTING_KEYS {
        let upper = key.to_ascii_uppercase();
        if let Some(v) = env(&format!("CHAT_{upper}")) {
            apply_setting(&mut settings, key, &v);
        }
        if let Some(v) = env(&format!("APP__{upper}")) {
            apply_setting(&mut settings, key, &v);
        }
    }

    settings
}

const SETTING_KEYS: &[&str] = &[
    "api_url",
    "realtime_url",
    "database_url",
    "initial_page_size",
    "older_page_size",
    "retained_messages_on_switch",
    "reconcile_window_ms",
    "typing_expiry_ms",
    "typing_collapse_threshold",
    "visibility_refresh_after_secs",
    "reconnect_base_delay_ms",
    "reconnect_max_delay_ms",
    "reconnect_max_attempts",
    "offline_max_retries",
    "max_message_length",
    "tombstone_ttl_days",
];

fn apply_setting(settings: &mut EngineSettings, key: &str, value: &str) {
    fn parse_into<T: std::str::FromStr>(slot: &mut T, value: &str) {
        if let Ok(parsed) = value.trim().parse::<T>() {
            *slot = parsed;
        }
    }

    match key {
        "api_url" => settings.api_url = value.to_string(),
        "realtime_url" => settings.realtime_url = Some(value.to_string()),
        "database_url" => settings.database_url = value.to_string(),
        "initial_page_size" => parse_into(&mut settings.initial_page_size, value),
        "older_page_size" => parse_into(&mut settings.older_page_size, value),
        "retained_messages_on_switch" => {
            parse_into(&mut settings.retained_messages_on_switch, value)
        }
        "reconcile_window_ms" => parse_into(&mut settings.reconcile_window_ms, value),
        "typing_expiry_ms" => parse_into(&mut settings.typing_expiry_ms, value),
        "typing_collapse_threshold" => parse_into(&mut settings.typing_collapse_threshold, value),
        "visibility_refresh_after_secs" => {
            parse_into(&mut settings.visibility_refresh_after_secs, value)
        }
        "reconnect_base_delay_ms" => parse_into(&mut settings.reconnect_base_delay_ms, value),
        "reconnect_max_delay_ms" => parse_into(&mut settings.reconnect_max_delay_ms, value),
        "reconnect_max_attempts" => parse_into(&mut settings.reconnect_max_attempts, value),
        "offline_max_retries" => parse_into(&mut settings.offline_max_retries, value),
        "max_message_length" => parse_into(&mut settings.max_message_length, value),
        "tombstone_ttl_days" => parse_into(&mut settings.tombstone_ttl_days, value),
        _ => {}
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
