pub mod backend;
pub mod catalog;
pub mod config;
pub mod coords;
pub mod errors;
pub mod geometry;
pub mod importer;
pub mod ingestion;
pub mod models;
pub mod overlay;
pub mod payload;
pub mod preview;
pub mod secrets;
pub mod selection;
pub mod settings;
pub mod sql_dump;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::backend::BackendClient;
use crate::catalog::{FieldResolver, MunicipioCache};
use crate::config::{AppConfig, PublicAppConfig};
use crate::geometry::{geometry_provider, RouteGeometryProvider};
use crate::importer::{CompanyImporter, RouteImporter};
use crate::overlay::MapSurface;
use crate::payload::PayloadBuilder;
use crate::secrets::{SecretVault, SESSION_TOKEN_ALIAS};
use crate::selection::SelectionController;
use crate::settings::{settings_path, RuntimeSettings, UpdateRuntimeSettingsPayload, UserSettings};
use crate::telemetry::{TelemetryClient, TelemetryKind};

pub use crate::errors::{AppError, AppResult};

const VAULT_SERVICE_NAME: &str = "MobziAdmin";

#[derive(Debug, Serialize)]
pub struct RuntimeHealth {
    pub settings_path: String,
    pub telemetry_buffer_path: String,
    pub telemetry_queue_depth: usize,
    pub has_session: bool,
    pub config: PublicAppConfig,
    pub settings: RuntimeSettings,
}

/// Everything the admin and map screens share for one app run.
pub struct AppState {
    config: AppConfig,
    vault: SecretVault,
    telemetry: TelemetryClient,
    settings_path: PathBuf,
    settings: Mutex<UserSettings>,
    backend: Mutex<Arc<BackendClient>>,
    municipios: Arc<MunicipioCache>,
    geometry: Arc<dyn RouteGeometryProvider>,
}

impl AppState {
    pub fn initialize(data_dir: &Path) -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();
        Self::with_config(data_dir, config, SecretVault::new(VAULT_SERVICE_NAME))
    }

    pub fn with_config(data_dir: &Path, config: AppConfig, vault: SecretVault) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let settings_path = settings_path(data_dir);
        let settings = UserSettings::load(&settings_path, &config)?;
        let telemetry = TelemetryClient::new(data_dir, &config)?;
        telemetry.set_enabled(settings.telemetry_enabled);

        let backend = BackendClient::new(&config, settings.api_base_url(&config), vault.clone())?;
        let municipios = Arc::new(MunicipioCache::new(Duration::from_secs(
            config.municipios_cache_ttl_secs,
        )));
        let geometry = geometry_provider(&config)?;

        if let Err(err) = telemetry.record(
            TelemetryKind::AppStart,
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "api_base_url": backend.base_url(),
                "has_mapbox_token": config.mapbox_token.is_some(),
            }),
        ) {
            warn!(?err, "app start event not queued");
        }
        if let Err(err) = telemetry.flush() {
            warn!(?err, "telemetry buffer not written at startup");
        }
        info!(api_base_url = backend.base_url(), "mobzi core initialized");

        Ok(Self {
            config,
            vault,
            telemetry,
            settings_path,
            settings: Mutex::new(settings),
            backend: Mutex::new(Arc::new(backend)),
            municipios,
            geometry,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryClient {
        &self.telemetry
    }

    pub fn backend(&self) -> Arc<BackendClient> {
        self.backend.lock().clone()
    }

    pub fn health(&self) -> AppResult<RuntimeHealth> {
        Ok(RuntimeHealth {
            settings_path: self.settings_path.to_string_lossy().to_string(),
            telemetry_buffer_path: self.telemetry.buffer_path().to_string_lossy().to_string(),
            telemetry_queue_depth: self.telemetry.queue_depth(),
            has_session: self.vault.has(SESSION_TOKEN_ALIAS)?,
            config: self.config.public_profile(),
            settings: self.runtime_settings(),
        })
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        self.settings.lock().runtime_profile(&self.config)
    }

    /// Persists the patch. A new backend URL swaps the client and drops the
    /// cached municipality list.
    pub fn update_runtime_settings(
        &self,
        payload: UpdateRuntimeSettingsPayload,
    ) -> AppResult<RuntimeSettings> {
        let (profile, base_url) = {
            let mut settings = self.settings.lock();
            settings.apply_patch(&payload);
            settings.persist(&self.settings_path)?;
            (
                settings.runtime_profile(&self.config),
                settings.api_base_url(&self.config),
            )
        };
        self.telemetry.set_enabled(profile.telemetry_enabled);

        if base_url != self.backend().base_url() {
            let client = BackendClient::new(&self.config, base_url, self.vault.clone())?;
            *self.backend.lock() = Arc::new(client);
            self.municipios.invalidate();
        }

        if let Err(err) = self.telemetry.record(
            TelemetryKind::SettingsUpdated,
            json!({
                "telemetry_enabled": profile.telemetry_enabled,
                "backend_url_overridden": profile.backend_url_overridden,
            }),
        ) {
            warn!(?err, "settings event not queued");
        }
        Ok(profile)
    }

    pub fn store_session_token(&self, token: impl Into<String>) -> AppResult<()> {
        self.vault.store_session_token(token)
    }

    pub fn sign_out(&self) -> AppResult<()> {
        self.vault.clear_session_token()
    }

    pub fn route_importer(&self) -> RouteImporter {
        let backend = self.backend();
        RouteImporter::new(self.payload_builder(&backend), backend)
            .with_telemetry(self.telemetry.clone())
    }

    pub fn company_importer(&self) -> CompanyImporter {
        let backend = self.backend();
        CompanyImporter::new(self.payload_builder(&backend), backend)
            .with_telemetry(self.telemetry.clone())
    }

    pub fn selection_controller<M: MapSurface>(&self, surface: M) -> SelectionController<M> {
        SelectionController::new(self.backend(), Arc::clone(&self.geometry), surface)
            .with_telemetry(self.telemetry.clone())
    }

    pub fn record_telemetry_event(
        &self,
        kind: TelemetryKind,
        payload: Value,
        flush: bool,
    ) -> AppResult<()> {
        self.telemetry.record(kind, payload)?;
        if flush {
            self.telemetry.flush()?;
        }
        Ok(())
    }

    fn payload_builder(&self, backend: &Arc<BackendClient>) -> PayloadBuilder {
        PayloadBuilder::new(FieldResolver::new(
            backend.clone(),
            Arc::clone(&self.municipios),
            self.config.default_municipio_id.clone(),
        ))
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,mobzi_core=debug"));
        // A host may already own the global subscriber.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
