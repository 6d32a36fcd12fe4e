use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::configuration;

pub const DEFAULT_USER_AGENT: &str = "pressmigrate/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRIES: usize = 1;
pub const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigratorConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Custom post type → category name, used by `post-type-to-category`.
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoreSection {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RemoteSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub request_delay_ms: Option<u64>,
    pub retries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LoggingSection {
    pub filter: Option<String>,
}

/// Effective remote client settings after env and config resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub request_delay_ms: u64,
    pub retries: usize,
}

impl MigratorConfig {
    /// Resolve remote settings: env > config > defaults.
    pub fn remote_settings(&self) -> RemoteSettings {
        self.remote_settings_with_lookup(|key| env::var(key).ok())
    }

    fn remote_settings_with_lookup<F>(&self, lookup_env: F) -> RemoteSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_u64 = |key: &str| {
            lookup_env(key).and_then(|value| value.trim().parse::<u64>().ok())
        };
        let user_agent = lookup_env("PRESSMIGRATE_USER_AGENT")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| self.remote.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        RemoteSettings {
            user_agent,
            timeout_ms: env_u64("PRESSMIGRATE_HTTP_TIMEOUT_MS")
                .or(self.remote.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            request_delay_ms: env_u64("PRESSMIGRATE_REQUEST_DELAY_MS")
                .or(self.remote.request_delay_ms)
                .unwrap_or(DEFAULT_REQUEST_DELAY_MS),
            retries: lookup_env("PRESSMIGRATE_HTTP_RETRIES")
                .and_then(|value| value.trim().parse::<usize>().ok())
                .or(self.remote.retries)
                .unwrap_or(DEFAULT_RETRIES),
        }
    }

    /// Tracing filter directive: config value or the quiet default.
    pub fn log_filter(&self) -> &str {
        self.logging
            .filter
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER)
    }

    pub fn category_for_type(&self, post_type: &str) -> Option<&str> {
        self.categories
            .get(post_type)
            .map(String::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Load and parse a config file. Returns defaults if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigratorConfig> {
    if !config_path.exists() {
        return Ok(MigratorConfig::default());
    }
    let content = fs::read_to_string(config_path).map_err(|error| {
        configuration(format!("failed to read {}: {error}", config_path.display()))
    })?;
    toml::from_str(&content).map_err(|error| {
        configuration(format!("failed to parse {}: {error}", config_path.display()))
    })
}

pub fn render_default_config() -> String {
    format!(
        "# pressmigrate configuration (written by `pressmigrate init`)\n\n[store]\n# path = \".pressmigrate/site.db\"\n\n[remote]\nuser_agent = \"{DEFAULT_USER_AGENT}\"\ntimeout_ms = {DEFAULT_TIMEOUT_MS}\n# Fixed pause between outbound requests to a publisher's host.\nrequest_delay_ms = {DEFAULT_REQUEST_DELAY_MS}\nretries = {DEFAULT_RETRIES}\n\n[logging]\nfilter = \"{DEFAULT_LOG_FILTER}\"\n\n# Custom post type -> category for `pressmigrate post-type-to-category`.\n[categories]\n# obituary = \"Obituaries\"\n"
    )
}
