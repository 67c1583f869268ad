use std::str::FromStr;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_API_URL: &str = "http://localhost:3001/api/v1";
const DEFAULT_MAPBOX_API_BASE: &str = "https://api.mapbox.com";
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;
const API_PATH_SUFFIX: &str = "/api/v1";
const DEFAULT_MUNICIPIO_ID: &str = "huamantla";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base_url: String,
    pub api_timeout_ms: u64,
    pub mapbox_token: Option<SecretString>,
    pub mapbox_api_base: String,
    pub directions_max_waypoints: usize,
    pub geometry_timeout_ms: u64,
    pub municipios_cache_ttl_secs: u64,
    pub default_municipio_id: String,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub api_base_url: String,
    pub api_timeout_ms: u64,
    pub mapbox_api_base: String,
    pub directions_max_waypoints: usize,
    pub geometry_timeout_ms: u64,
    pub municipios_cache_ttl_secs: u64,
    pub default_municipio_id: String,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
    pub has_mapbox_token: bool,
}

impl AppConfig {
    /// Reads the process environment, loading `.env` first in debug builds
    /// or when `ALLOW_DOTENV` is set.
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or blank keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvVars(&lookup);
        Self {
            api_base_url: normalize_api_base(
                &vars.text("MOBZI_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            ),
            api_timeout_ms: vars.parsed("MOBZI_API_TIMEOUT_MS", 60_000),
            mapbox_token: vars.text("MAPBOX_TOKEN").map(SecretString::from),
            mapbox_api_base: vars
                .text("MAPBOX_API_BASE")
                .unwrap_or_else(|| DEFAULT_MAPBOX_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            directions_max_waypoints: vars
                .parsed("MAPBOX_DIRECTIONS_MAX_WAYPOINTS", 25_usize)
                .max(2),
            geometry_timeout_ms: vars.parsed("GEOMETRY_TIMEOUT_MS", 10_000),
            municipios_cache_ttl_secs: vars.parsed("MUNICIPIOS_CACHE_TTL_SECS", 300),
            default_municipio_id: vars
                .text("DEFAULT_MUNICIPIO_ID")
                .unwrap_or_else(|| DEFAULT_MUNICIPIO_ID.to_string()),
            telemetry_enabled_by_default: vars.flag("TELEMETRY_ENABLED", true),
            telemetry_batch_size: vars.parsed("TELEMETRY_BATCH_SIZE", 25_usize).max(1),
            telemetry_buffer_max_bytes: vars.parsed(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
            telemetry_buffer_max_files: vars
                .parsed(
                    "TELEMETRY_BUFFER_MAX_FILES",
                    DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
                )
                .max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            api_base_url: self.api_base_url.clone(),
            api_timeout_ms: self.api_timeout_ms,
            mapbox_api_base: self.mapbox_api_base.clone(),
            directions_max_waypoints: self.directions_max_waypoints,
            geometry_timeout_ms: self.geometry_timeout_ms,
            municipios_cache_ttl_secs: self.municipios_cache_ttl_secs,
            default_municipio_id: self.default_municipio_id.clone(),
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
            telemetry_batch_size: self.telemetry_batch_size,
            telemetry_buffer_max_bytes: self.telemetry_buffer_max_bytes,
            telemetry_buffer_max_files: self.telemetry_buffer_max_files,
            has_mapbox_token: self.mapbox_token.is_some(),
        }
    }
}

/// Trims trailing slashes and makes sure the URL ends in `/api/v1`.
pub fn normalize_api_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.ends_with(API_PATH_SUFFIX) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{API_PATH_SUFFIX}")
    }
}

fn load_dotenv_if_applicable() {
    let read = |key: &str| env::var(key).ok();
    let process = EnvVars(&read);
    if !(cfg!(debug_assertions) || process.flag("ALLOW_DOTENV", false)) {
        debug!("release build without ALLOW_DOTENV; ignoring .env");
        return;
    }
    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(dotenvy::Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => debug!(?err, "could not read .env"),
    }
}

struct EnvVars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl EnvVars<'_> {
    fn text(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.text(key) {
            Some(value) => matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            None => default,
        }
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        self.text(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        api_base_url: DEFAULT_API_URL.to_string(),
        api_timeout_ms: 5_000,
        mapbox_token: None,
        mapbox_api_base: DEFAULT_MAPBOX_API_BASE.to_string(),
        directions_max_waypoints: 25,
        geometry_timeout_ms: 1_000,
        municipios_cache_ttl_secs: 300,
        default_municipio_id: DEFAULT_MUNICIPIO_ID.to_string(),
        telemetry_enabled_by_default: true,
        telemetry_batch_size: 2,
        telemetry_buffer_max_bytes: 1024,
        telemetry_buffer_max_files: 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn public_profile_hides_mapbox_token() {
        let config = AppConfig::from_lookup(lookup(&[
            ("MAPBOX_TOKEN", "secret"),
            ("MOBZI_API_URL", "https://mobzi.example.com/"),
            ("TELEMETRY_BATCH_SIZE", "10"),
        ]));
        let public = config.public_profile();

        assert_eq!(public.api_base_url, "https://mobzi.example.com/api/v1");
        assert!(public.has_mapbox_token);
        assert!(config.mapbox_token.is_some());
        assert_eq!(public.telemetry_batch_size, 10);
        assert_eq!(
            public.telemetry_buffer_max_bytes,
            DEFAULT_TELEMETRY_BUFFER_MAX_BYTES
        );
        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn blank_and_invalid_values_fall_back_to_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("MAPBOX_TOKEN", "   "),
            ("MAPBOX_DIRECTIONS_MAX_WAYPOINTS", "1"),
            ("GEOMETRY_TIMEOUT_MS", "soon"),
            ("TELEMETRY_ENABLED", "No"),
            ("MAPBOX_API_BASE", "https://proxy.local/"),
        ]));
        assert!(config.mapbox_token.is_none());
        assert_eq!(config.directions_max_waypoints, 2);
        assert_eq!(config.geometry_timeout_ms, 10_000);
        assert!(!config.telemetry_enabled_by_default);
        assert_eq!(config.mapbox_api_base, "https://proxy.local");
        assert_eq!(config.api_base_url, DEFAULT_API_URL);
        assert_eq!(config.default_municipio_id, DEFAULT_MUNICIPIO_ID);
    }

    #[test]
    fn api_base_keeps_existing_suffix() {
        assert_eq!(
            normalize_api_base("http://10.0.0.2:3001/api/v1/"),
            "http://10.0.0.2:3001/api/v1"
        );
        assert_eq!(
            normalize_api_base(" https://x.ngrok.app "),
            "https://x.ngrok.app/api/v1"
        );
    }
}
