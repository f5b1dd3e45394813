use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use manilink_core::{
    CoreError, DEFAULT_ENCRYPT_PATH, DEFAULT_NATIVE_SCHEME, DEFAULT_NOTIFICATION_AUTO_CLOSE_MS,
    DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_WEB_APP_ENTRY, Origin,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::orchestrator::DeliverySettings;

/// `settings.json` is expected to be tiny.
pub const MAX_SETTINGS_BYTES: u64 = 64 * 1024;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_ORIGIN: &str = "http://localhost:3000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Scheme and host of the addon server; manifest links point here.
    pub origin: String,
    pub encrypt_path: String,
    pub request_timeout_ms: u64,
    pub native_scheme: String,
    pub web_app_entry: String,
    pub notification_auto_close_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_owned(),
            encrypt_path: DEFAULT_ENCRYPT_PATH.to_owned(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            native_scheme: DEFAULT_NATIVE_SCHEME.to_owned(),
            web_app_entry: DEFAULT_WEB_APP_ENTRY.to_owned(),
            notification_auto_close_ms: DEFAULT_NOTIFICATION_AUTO_CLOSE_MS,
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> Result<(), String> {
        let mut errors: Vec<String> = Vec::new();

        match Url::parse(self.origin.trim()) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    errors.push("Origin must start with http:// or https://.".to_owned());
                }
                if url.host_str().is_none() {
                    errors.push("Origin must include a host.".to_owned());
                }
            }
            Err(err) => errors.push(format!("Origin is invalid: {err}")),
        }

        if !self.encrypt_path.starts_with('/') {
            errors.push("Encrypt path must start with '/'.".to_owned());
        }

        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_REQUEST_TIMEOUT_MS {
            errors.push(format!(
                "Request timeout must be between 1 and {MAX_REQUEST_TIMEOUT_MS} ms."
            ));
        }

        let scheme = self.native_scheme.trim();
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            errors.push("Native scheme must be a non-empty alphanumeric name.".to_owned());
        }

        if let Err(err) = Url::parse(&self.web_app_entry) {
            errors.push(format!("Web app entry is invalid: {err}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "Please fix the following:\n\n- {}",
                errors.join("\n- ")
            ))
        }
    }

    pub fn origin(&self) -> Result<Origin, CoreError> {
        Origin::parse(self.origin.trim())
    }

    pub fn encrypt_endpoint(&self) -> Result<String, CoreError> {
        Ok(format!("{}{}", self.origin()?.base_url(), self.encrypt_path))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn notification_auto_close(&self) -> Duration {
        Duration::from_millis(self.notification_auto_close_ms)
    }

    pub fn delivery_settings(&self) -> Result<DeliverySettings, CoreError> {
        Ok(DeliverySettings {
            origin: self.origin()?,
            native_scheme: self.native_scheme.trim().to_owned(),
            web_app_entry: self.web_app_entry.clone(),
        })
    }
}

#[derive(Debug, Error)]
pub enum SettingsLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SettingsSaveError {
    #[error("{0}")]
    Invalid(String),
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("create settings directory failed: {0}")]
    CreateDir(#[source] io::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

pub fn settings_path() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("MANILINK_CONFIG_DIR") {
        return PathBuf::from(override_dir).join("settings.json");
    }

    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("APPDATA").map(PathBuf::from))
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("manilink").join("settings.json")
}

pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings, SettingsLoadError> {
    let meta = fs::metadata(path).map_err(SettingsLoadError::Metadata)?;
    if meta.len() > MAX_SETTINGS_BYTES {
        return Err(SettingsLoadError::TooLarge {
            size: meta.len(),
            max: MAX_SETTINGS_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(SettingsLoadError::Read)?;
    let settings: ClientSettings = serde_json::from_str(&data)?;
    settings.validate().map_err(SettingsLoadError::Invalid)?;
    Ok(settings)
}

/// Settings from an explicitly named file. A missing file yields the
/// defaults rather than whatever the default location holds.
pub fn load_settings_or_default(path: &Path) -> Result<ClientSettings, SettingsLoadError> {
    if !path.exists() {
        warn!("settings file {} not found, using defaults", path.display());
        return Ok(ClientSettings::default());
    }
    load_settings_from_path(path)
}

/// Settings from the default location; defaults when absent or unusable.
pub fn load_settings() -> ClientSettings {
    let path = settings_path();
    if !path.exists() {
        return ClientSettings::default();
    }
    match load_settings_from_path(&path) {
        Ok(settings) => settings,
        Err(err) => {
            warn!("ignoring settings file {}: {}", path.display(), err);
            ClientSettings::default()
        }
    }
}

pub fn save_settings_to_path(
    path: &Path,
    settings: &ClientSettings,
) -> Result<(), SettingsSaveError> {
    settings.validate().map_err(SettingsSaveError::Invalid)?;

    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(SettingsSaveError::CreateDir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(settings)?;
    fs::write(&tmp, payload.as_bytes()).map_err(SettingsSaveError::WriteTmp)?;

    // rename replaces an existing file, so the old settings survive a failed save.
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(SettingsSaveError::Rename(err));
    }
    Ok(())
}

pub fn save_settings_with_retry(
    path: &Path,
    settings: &ClientSettings,
) -> Result<(), SettingsSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match save_settings_to_path(path, settings) {
            Ok(()) => return Ok(()),
            Err(err @ SettingsSaveError::Invalid(_)) => return Err(err),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(attempt, "saving settings failed, retrying: {}", err);
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
