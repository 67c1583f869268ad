use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use secrecy::ExposeSecret;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    CompanyRecord, CompanyUpdate, EmpresaAdmin, EmpresaPublica, Municipio, RouteRecord,
    RouteUpdate, RutaAdmin, RutaDetails, RutaPublica, SavedStatus, UsuarioAdmin,
};
use crate::secrets::SecretVault;

const RATE_LIMIT_MESSAGE: &str = "Too many requests. Please wait a moment.";
const GENERIC_FAILURE: &str = "Request failed";

/// Read side the import resolver needs.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn municipios(&self) -> AppResult<Vec<Municipio>>;
    async fn empresas_by_municipio(&self, municipio_id: &str) -> AppResult<Vec<EmpresaPublica>>;
}

/// Write side of the admin import flow.
#[async_trait]
pub trait AdminGateway: Send + Sync {
    async fn create_ruta(&self, record: &RouteRecord) -> AppResult<()>;
    async fn create_empresa(&self, record: &CompanyRecord) -> AppResult<()>;
    async fn list_rutas(&self) -> AppResult<Vec<RutaAdmin>>;
    async fn list_empresas(&self) -> AppResult<Vec<EmpresaAdmin>>;
}

#[async_trait]
pub trait RouteDetailsSource: Send + Sync {
    async fn fetch_details(&self, route_id: &str) -> AppResult<RutaDetails>;
    /// `None` when there is no signed-in session to ask about.
    async fn fetch_saved_status(&self, route_id: &str) -> AppResult<Option<SavedStatus>>;
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    message: Option<String>,
    #[serde(default)]
    errors: Vec<FieldError>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldError {
    #[serde(default)]
    pub field: String,
    pub message: String,
}

impl<T> ApiEnvelope<T> {
    fn failure_message(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .or_else(|| self.errors.first().map(|e| format!("{}: {}", e.field, e.message)))
            .unwrap_or_else(|| GENERIC_FAILURE.to_string())
    }
}

/// HTTP client for the MOBZI REST backend.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    vault: SecretVault,
}

impl BackendClient {
    pub fn new(config: &AppConfig, base_url: impl Into<String>, vault: SecretVault) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.api_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            vault,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_session(&self) -> bool {
        matches!(self.vault.session_token(), Ok(Some(_)))
    }

    pub async fn rutas_by_municipio(&self, municipio_id: &str) -> AppResult<Vec<RutaPublica>> {
        let url = self.endpoint(&["rutas"])?;
        let data = self
            .call::<Vec<RutaPublica>, ()>(Method::GET, url, &[("municipio", municipio_id)], None, false)
            .await?;
        Ok(data.unwrap_or_default())
    }

    pub async fn update_ruta(&self, id: &str, update: &RouteUpdate) -> AppResult<Option<RutaAdmin>> {
        let url = self.endpoint(&["admin", "rutas", id])?;
        self.call(Method::PUT, url, &[], Some(update), true).await
    }

    pub async fn delete_ruta(&self, id: &str) -> AppResult<()> {
        let url = self.endpoint(&["admin", "rutas", id])?;
        self.call::<IgnoredAny, ()>(Method::DELETE, url, &[], None, true)
            .await
            .map(|_| ())
    }

    pub async fn update_empresa(
        &self,
        id: &str,
        update: &CompanyUpdate,
    ) -> AppResult<Option<EmpresaAdmin>> {
        let url = self.endpoint(&["admin", "empresas", id])?;
        self.call(Method::PUT, url, &[], Some(update), true).await
    }

    pub async fn delete_empresa(&self, id: &str) -> AppResult<()> {
        let url = self.endpoint(&["admin", "empresas", id])?;
        self.call::<IgnoredAny, ()>(Method::DELETE, url, &[], None, true)
            .await
            .map(|_| ())
    }

    pub async fn list_usuarios(&self) -> AppResult<Vec<UsuarioAdmin>> {
        let url = self.endpoint(&["admin", "usuarios"])?;
        let data = self
            .call::<Vec<UsuarioAdmin>, ()>(Method::GET, url, &[], None, true)
            .await?;
        Ok(data.unwrap_or_default())
    }

    pub async fn set_usuario_activo(&self, id: &str, activo: bool) -> AppResult<()> {
        let url = self.endpoint(&["admin", "usuarios", id, "activo"])?;
        let body = json!({ "activo": activo });
        self.call::<IgnoredAny, _>(Method::PATCH, url, &[], Some(&body), true)
            .await
            .map(|_| ())
    }

    pub async fn delete_usuario(&self, id: &str) -> AppResult<()> {
        let url = self.endpoint(&["admin", "usuarios", id])?;
        self.call::<IgnoredAny, ()>(Method::DELETE, url, &[], None, true)
            .await
            .map(|_| ())
    }

    fn endpoint(&self, segments: &[&str]) -> AppResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| AppError::Config(format!("invalid backend URL {}: {err}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("backend URL cannot take a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call<T, B>(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<&B>,
        requires_auth: bool,
    ) -> AppResult<Option<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        debug!(target: "backend", %method, path = url.path(), "backend request");
        let mut request = self.http.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        if requires_auth {
            if let Some(token) = self.vault.session_token()? {
                request = request.bearer_auth(token.expose_secret());
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .or_else(|| response.headers().get("x-ratelimit-reset"))
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let text = response.text().await?;
        let envelope = serde_json::from_str::<ApiEnvelope<T>>(&text);

        if !status.is_success() {
            let message = match &envelope {
                Ok(parsed) => parsed.failure_message(),
                Err(_) if !text.trim().is_empty() => text.trim().to_string(),
                Err(_) => GENERIC_FAILURE.to_string(),
            };
            return Err(self.reject(status, message, retry_after));
        }

        let envelope = envelope?;
        if !envelope.success {
            let message = envelope.failure_message();
            return Err(AppError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(envelope.data)
    }

    fn reject(&self, status: StatusCode, message: String, retry_after: Option<u64>) -> AppError {
        if status == StatusCode::UNAUTHORIZED {
            warn!(target: "backend", "session rejected; clearing stored token");
            if let Err(err) = self.vault.clear_session_token() {
                warn!(target: "backend", ?err, "failed to clear session token");
            }
        }
        let message = if status == StatusCode::TOO_MANY_REQUESTS {
            rate_limit_message(&message, retry_after)
        } else {
            message
        };
        AppError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

fn rate_limit_message(server_message: &str, retry_after_secs: Option<u64>) -> String {
    let mut message = if server_message.is_empty() || server_message == GENERIC_FAILURE {
        RATE_LIMIT_MESSAGE.to_string()
    } else {
        server_message.to_string()
    };
    if let Some(seconds) = retry_after_secs {
        let minutes = seconds.div_ceil(60).max(1);
        let unit = if minutes > 1 { "minutes" } else { "minute" };
        message.push_str(&format!(" Try again in about {minutes} {unit}."));
    }
    message
}

#[async_trait]
impl CatalogLookup for BackendClient {
    async fn municipios(&self) -> AppResult<Vec<Municipio>> {
        let url = self.endpoint(&["municipios"])?;
        let data = self
            .call::<Vec<Municipio>, ()>(Method::GET, url, &[], None, false)
            .await?;
        Ok(data.unwrap_or_default())
    }

    async fn empresas_by_municipio(&self, municipio_id: &str) -> AppResult<Vec<EmpresaPublica>> {
        let url = self.endpoint(&["empresas"])?;
        let data = self
            .call::<Vec<EmpresaPublica>, ()>(
                Method::GET,
                url,
                &[("municipio", municipio_id)],
                None,
                false,
            )
            .await?;
        Ok(data.unwrap_or_default())
    }
}

#[async_trait]
impl AdminGateway for BackendClient {
    async fn create_ruta(&self, record: &RouteRecord) -> AppResult<()> {
        let url = self.endpoint(&["admin", "rutas"])?;
        self.call::<IgnoredAny, _>(Method::POST, url, &[], Some(record), true)
            .await
            .map(|_| ())
    }

    async fn create_empresa(&self, record: &CompanyRecord) -> AppResult<()> {
        let url = self.endpoint(&["admin", "empresas"])?;
        self.call::<IgnoredAny, _>(Method::POST, url, &[], Some(record), true)
            .await
            .map(|_| ())
    }

    async fn list_rutas(&self) -> AppResult<Vec<RutaAdmin>> {
        let url = self.endpoint(&["admin", "rutas"])?;
        let data = self
            .call::<Vec<RutaAdmin>, ()>(Method::GET, url, &[], None, true)
            .await?;
        Ok(data.unwrap_or_default())
    }

    async fn list_empresas(&self) -> AppResult<Vec<EmpresaAdmin>> {
        let url = self.endpoint(&["admin", "empresas"])?;
        let data = self
            .call::<Vec<EmpresaAdmin>, ()>(Method::GET, url, &[], None, true)
            .await?;
        Ok(data.unwrap_or_default())
    }
}

#[async_trait]
impl RouteDetailsSource for BackendClient {
    async fn fetch_details(&self, route_id: &str) -> AppResult<RutaDetails> {
        let url = self.endpoint(&["rutas", route_id])?;
        self.call::<RutaDetails, ()>(Method::GET, url, &[], None, false)
            .await?
            .ok_or_else(|| AppError::Api {
                status: StatusCode::OK.as_u16(),
                message: format!("route {route_id} returned no details"),
            })
    }

    async fn fetch_saved_status(&self, route_id: &str) -> AppResult<Option<SavedStatus>> {
        if !self.has_session() {
            return Ok(None);
        }
        let url = self.endpoint(&["rutas", route_id, "guardada"])?;
        let status = self
            .call::<SavedStatus, ()>(Method::GET, url, &[], None, true)
            .await?;
        Ok(Some(status.unwrap_or_default()))
    }
}
