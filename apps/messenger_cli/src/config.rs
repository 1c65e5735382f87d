use std::{collections::HashMap, fs, path::Path};

use anyhow::Context;
use client_core::{derive_push_url, PaginationLimits, StoreOptions};
use url::Url;

pub const SETTINGS_FILE: &str = "messenger.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub push_url: Option<String>,
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub surrounding_limit: u32,
    pub page_limit: u32,
    pub report_reconnect_gaps: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let limits = PaginationLimits::default();
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            push_url: None,
            token: String::new(),
            user_id: String::new(),
            username: String::new(),
            surrounding_limit: limits.surrounding,
            page_limit: limits.previous,
            report_reconnect_gaps: false,
        }
    }
}

impl Settings {
    pub fn server_url(&self) -> anyhow::Result<Url> {
        Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url '{}'", self.server_url))
    }

    /// Configured push url, or the one derived from the server url.
    pub fn push_url(&self) -> anyhow::Result<Url> {
        match &self.push_url {
            Some(raw) => Url::parse(raw).with_context(|| format!("invalid push url '{raw}'")),
            None => derive_push_url(&self.server_url()?),
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        let defaults = PaginationLimits::default();
        StoreOptions {
            limits: PaginationLimits {
                surrounding: self.surrounding_limit,
                find_surrounding: defaults.find_surrounding.min(self.surrounding_limit),
                previous: self.page_limit,
                next: self.page_limit,
            },
            report_reconnect_gaps: self.report_reconnect_gaps,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    apply_file(&mut settings, Path::new(SETTINGS_FILE));
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Reads flat `key = "value"` pairs. A missing or malformed file leaves the
/// settings untouched.
fn apply_file(settings: &mut Settings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    let file_cfg = match toml::from_str::<HashMap<String, String>>(&raw) {
        Ok(file_cfg) => file_cfg,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring settings file");
            return;
        }
    };

    if let Some(v) = file_cfg.get("server_url") {
        settings.server_url = v.clone();
    }
    if let Some(v) = file_cfg.get("push_url") {
        settings.push_url = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("token") {
        settings.token = v.clone();
    }
    if let Some(v) = file_cfg.get("user_id") {
        settings.user_id = v.clone();
    }
    if let Some(v) = file_cfg.get("username") {
        settings.username = v.clone();
    }
    if let Some(v) = file_cfg.get("surrounding_limit").and_then(|v| v.parse().ok()) {
        settings.surrounding_limit = v;
    }
    if let Some(v) = file_cfg.get("page_limit").and_then(|v| v.parse().ok()) {
        settings.page_limit = v;
    }
    if let Some(v) = file_cfg.get("report_reconnect_gaps").and_then(|v| parse_flag(v)) {
        settings.report_reconnect_gaps = v;
    }
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("MESSENGER_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = var("MESSENGER_PUSH_URL") {
        settings.push_url = Some(v);
    }

    if let Some(v) = var("MESSENGER_TOKEN") {
        settings.token = v;
    }

    if let Some(v) = var("MESSENGER_USER_ID") {
        settings.user_id = v;
    }
    if let Some(v) = var("MESSENGER_USERNAME") {
        settings.username = v;
    }

    if let Some(v) = var("APP__SURROUNDING_LIMIT") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.surrounding_limit = parsed;
        }
    }
    if let Some(v) = var("APP__PAGE_LIMIT") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_limit = parsed;
        }
    }

    if let Some(v) = var("APP__REPORT_RECONNECT_GAPS") {
        if let Some(parsed) = parse_flag(&v) {
            settings.report_reconnect_gaps = parsed;
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
