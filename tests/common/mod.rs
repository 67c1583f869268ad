use httptest::Server;
use mobzi_core::config::AppConfig;
use mobzi_core::secrets::SecretVault;
use mobzi_core::AppState;
use secrecy::SecretString;
use tempfile::TempDir;

pub fn config_for(server: &Server, mapbox_token: Option<&str>) -> AppConfig {
    AppConfig {
        api_base_url: server.url_str("/api/v1"),
        api_timeout_ms: 5_000,
        mapbox_token: mapbox_token.map(SecretString::from),
        mapbox_api_base: server.url_str("/"),
        directions_max_waypoints: 25,
        geometry_timeout_ms: 2_000,
        municipios_cache_ttl_secs: 300,
        default_municipio_id: "huamantla".to_string(),
        telemetry_enabled_by_default: true,
        telemetry_batch_size: 10,
        telemetry_buffer_max_bytes: 64 * 1024,
        telemetry_buffer_max_files: 2,
    }
}

pub fn app_state(server: &Server, mapbox_token: Option<&str>) -> (AppState, TempDir) {
    let data_dir = tempfile::tempdir().unwrap();
    let state = AppState::with_config(
        data_dir.path(),
        config_for(server, mapbox_token),
        SecretVault::in_memory(),
    )
    .unwrap();
    (state, data_dir)
}
