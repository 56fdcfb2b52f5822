use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FreebeanError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_file: Option<String>,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub company_id: Option<i64>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_api_base_url() -> String {
    "https://api.freee.co.jp".to_string()
}

fn default_token_url() -> String {
    "https://accounts.secure.freee.co.jp/public_api/token".to_string()
}

fn default_currency() -> String {
    "JPY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            ledger_dir: None,
            mapping_file: None,
            api_base_url: default_api_base_url(),
            token_url: default_token_url(),
            company_id: None,
            access_token: None,
            client_id: None,
            client_secret: None,
            currency: default_currency(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl Settings {
    pub fn ledger_root(&self) -> PathBuf {
        match &self.ledger_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(&self.data_dir).join("ledger"),
        }
    }

    pub fn history_db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("freebean.db")
    }

    pub fn mapping_path(&self) -> PathBuf {
        match &self.mapping_file {
            Some(file) => PathBuf::from(file),
            None => PathBuf::from(&self.data_dir).join("account_mapping.json"),
        }
    }

    /// Overlay `FREEE_*` / `FREEBEAN_*` variables. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(token) = lookup("FREEE_ACCESS_TOKEN") {
            self.access_token = Some(token);
        }
        if let Some(raw) = lookup("FREEE_COMPANY_ID") {
            let id = raw.trim().parse().map_err(|_| {
                FreebeanError::Config(format!("FREEE_COMPANY_ID is not a number: {raw}"))
            })?;
            self.company_id = Some(id);
        }
        if let Some(id) = lookup("FREEE_CLIENT_ID") {
            self.client_id = Some(id);
        }
        if let Some(secret) = lookup("FREEE_CLIENT_SECRET") {
            self.client_secret = Some(secret);
        }
        if let Some(url) = lookup("FREEE_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(dir) = lookup("FREEBEAN_LEDGER_DIR") {
            self.ledger_dir = Some(dir);
        }
        Ok(())
    }

    /// Check everything a sync needs before any network or file I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.company_id.is_none() {
            return Err(FreebeanError::Config(
                "company_id is not set (settings.json or FREEE_COMPANY_ID)".to_string(),
            ));
        }
        let has_token = self.access_token.as_deref().is_some_and(|t| !t.is_empty());
        let has_credentials = self.client_id.is_some() && self.client_secret.is_some();
        if !has_token && !has_credentials {
            return Err(FreebeanError::Config(
                "no access_token and no client_id/client_secret configured".to_string(),
            ));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(FreebeanError::Config("api_base_url is empty".to_string()));
        }
        if self.currency.trim().is_empty() {
            return Err(FreebeanError::Config("currency is empty".to_string()));
        }
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("freebean")
}

pub fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("freebean")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if !path.exists() {
        return Settings::default();
    }
    let content = std::fs::read_to_string(&path).unwrap_or_default();
    match serde_json::from_str(&content) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings file");
            Settings::default()
        }
    }
}

/// Settings file plus environment overrides.
pub fn load_effective_settings() -> Result<Settings> {
    let mut settings = load_settings();
    settings.apply_env_overrides(|key| std::env::var(key).ok())?;
    Ok(settings)
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}
