use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{normalize_api_base, AppConfig};
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub telemetry_enabled: bool,
    #[serde(default)]
    pub backend_url_override: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSettings {
    pub telemetry_enabled: bool,
    pub api_base_url: String,
    pub backend_url_overridden: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuntimeSettingsPayload {
    pub telemetry_enabled: Option<bool>,
    /// `Some("")` clears the override.
    pub backend_url: Option<String>,
}

impl UserSettings {
    /// Reads `settings.json`, writing defaults when it is missing or unreadable JSON.
    pub fn load(path: &Path, config: &AppConfig) -> AppResult<Self> {
        if let Some(stored) = Self::read_stored(path)? {
            return Ok(stored);
        }
        let defaults = Self::from_config(config);
        defaults.persist(path)?;
        Ok(defaults)
    }

    fn read_stored(path: &Path) -> AppResult<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AppError::Io(err)),
        };
        match serde_json::from_str(&contents) {
            Ok(stored) => Ok(Some(stored)),
            Err(err) => {
                warn!(target: "settings", path = %path.display(), error = %err, "discarding unreadable settings");
                Ok(None)
            }
        }
    }

    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// The stored override wins over the environment.
    pub fn api_base_url(&self, config: &AppConfig) -> String {
        self.backend_url_override
            .clone()
            .unwrap_or_else(|| config.api_base_url.clone())
    }

    pub fn runtime_profile(&self, config: &AppConfig) -> RuntimeSettings {
        RuntimeSettings {
            telemetry_enabled: self.telemetry_enabled,
            api_base_url: self.api_base_url(config),
            backend_url_overridden: self.backend_url_override.is_some(),
        }
    }

    pub fn apply_patch(&mut self, payload: &UpdateRuntimeSettingsPayload) {
        if let Some(enabled) = payload.telemetry_enabled {
            self.telemetry_enabled = enabled;
        }
        if let Some(url) = &payload.backend_url {
            self.backend_url_override = if url.trim().is_empty() {
                None
            } else {
                Some(normalize_api_base(url))
            };
        }
    }

    fn from_config(config: &AppConfig) -> Self {
        Self {
            telemetry_enabled: config.telemetry_enabled_by_default,
            backend_url_override: None,
        }
    }
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use tempfile::tempdir;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempdir().unwrap();
        let config = test_config();
        let path = settings_path(dir.path());
        let settings = UserSettings::load(&path, &config).unwrap();
        assert!(settings.backend_url_override.is_none());
        assert_eq!(settings.api_base_url(&config), config.api_base_url);
        assert!(path.exists());
    }

    #[test]
    fn backend_override_survives_reload_and_blank_clears_it() {
        let dir = tempdir().unwrap();
        let config = test_config();
        let path = settings_path(dir.path());
        let mut settings = UserSettings::load(&path, &config).unwrap();
        settings.apply_patch(&UpdateRuntimeSettingsPayload {
            telemetry_enabled: Some(false),
            backend_url: Some("https://abc.ngrok-free.dev/".into()),
        });
        settings.persist(&path).unwrap();

        let reloaded = UserSettings::load(&path, &config).unwrap();
        assert!(!reloaded.telemetry_enabled);
        assert_eq!(
            reloaded.api_base_url(&config),
            "https://abc.ngrok-free.dev/api/v1"
        );

        let mut cleared = reloaded.clone();
        cleared.apply_patch(&UpdateRuntimeSettingsPayload {
            telemetry_enabled: None,
            backend_url: Some("  ".into()),
        });
        assert!(!cleared.runtime_profile(&config).backend_url_overridden);
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = test_config();
        let path = settings_path(dir.path());
        fs::write(&path, "{not json").unwrap();
        let settings = UserSettings::load(&path, &config).unwrap();
        assert_eq!(settings.telemetry_enabled, config.telemetry_enabled_by_default);
    }
}
