use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::coords::Position;
use crate::errors::{AppError, AppResult};

/// Turns stop waypoints into a drawable polyline.
#[async_trait]
pub trait RouteGeometryProvider: Send + Sync {
    async fn resolve(&self, waypoints: &[Position]) -> AppResult<Vec<Position>>;
}

/// Picks the provider stack for the current configuration. Without a Mapbox
/// token the waypoints are drawn as straight segments.
pub fn geometry_provider(config: &AppConfig) -> AppResult<Arc<dyn RouteGeometryProvider>> {
    match config.mapbox_token.clone() {
        Some(token) => {
            let mapbox = MapboxGeometryProvider::new(config, token)?;
            Ok(Arc::new(FallbackGeometry::new(Arc::new(mapbox))))
        }
        None => {
            debug!(target: "geometry", "no mapbox token configured; drawing raw waypoints");
            Ok(Arc::new(StraightLineGeometry))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapboxApi {
    Directions,
    Matching,
}

impl MapboxApi {
    fn path(self) -> &'static str {
        match self {
            MapboxApi::Directions => "directions",
            MapboxApi::Matching => "matching",
        }
    }
}

pub struct MapboxGeometryProvider {
    http: reqwest::Client,
    api_base: String,
    token: SecretString,
    max_directions_waypoints: usize,
}

impl MapboxGeometryProvider {
    pub fn new(config: &AppConfig, token: SecretString) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.geometry_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            api_base: config.mapbox_api_base.clone(),
            token,
            max_directions_waypoints: config.directions_max_waypoints,
        })
    }

    fn api_for(&self, waypoints: usize) -> MapboxApi {
        if waypoints <= self.max_directions_waypoints {
            MapboxApi::Directions
        } else {
            MapboxApi::Matching
        }
    }

    fn request_url(&self, api: MapboxApi, waypoints: &[Position]) -> AppResult<Url> {
        let joined = waypoints
            .iter()
            .map(|[lng, lat]| format!("{lng},{lat}"))
            .collect::<Vec<_>>()
            .join(";");
        let mut url = Url::parse(&self.api_base)
            .map_err(|err| AppError::Config(format!("invalid mapbox URL {}: {err}", self.api_base)))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("mapbox URL cannot take a path: {}", self.api_base)))?
            .pop_if_empty()
            .extend([api.path(), "v5", "mapbox", "driving", joined.as_str()]);
        url.query_pairs_mut()
            .append_pair("geometries", "geojson")
            .append_pair("overview", "full")
            .append_pair("access_token", self.token.expose_secret());
        Ok(url)
    }
}

#[async_trait]
impl RouteGeometryProvider for MapboxGeometryProvider {
    async fn resolve(&self, waypoints: &[Position]) -> AppResult<Vec<Position>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            routes: Vec<Candidate>,
            #[serde(default)]
            matchings: Vec<Candidate>,
        }

        #[derive(Deserialize)]
        struct Candidate {
            geometry: Geometry,
        }

        #[derive(Deserialize)]
        struct Geometry {
            #[serde(default)]
            coordinates: Vec<Position>,
        }

        if waypoints.len() < 2 {
            return Err(AppError::Geometry(format!(
                "need at least two waypoints, got {}",
                waypoints.len()
            )));
        }

        let api = self.api_for(waypoints.len());
        let url = self.request_url(api, waypoints)?;
        // The access token rides in the query string; keep it out of error text.
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| AppError::from(err.without_url()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Geometry(format!(
                "{} service answered {status}",
                api.path()
            )));
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|err| AppError::from(err.without_url()))?;
        let candidates = match api {
            MapboxApi::Directions => parsed.routes,
            MapboxApi::Matching => parsed.matchings,
        };
        let line = candidates
            .into_iter()
            .next()
            .map(|candidate| candidate.geometry.coordinates)
            .unwrap_or_default();
        debug!(
            target: "geometry",
            api = api.path(),
            waypoints = waypoints.len(),
            points = line.len(),
            "route geometry resolved"
        );
        Ok(line)
    }
}

/// Draws the waypoints themselves.
pub struct StraightLineGeometry;

#[async_trait]
impl RouteGeometryProvider for StraightLineGeometry {
    async fn resolve(&self, waypoints: &[Position]) -> AppResult<Vec<Position>> {
        Ok(waypoints.to_vec())
    }
}

/// Wraps a provider so that a failed or empty answer degrades to the raw
/// waypoints. Never returns an error.
pub struct FallbackGeometry {
    primary: Arc<dyn RouteGeometryProvider>,
}

impl FallbackGeometry {
    pub fn new(primary: Arc<dyn RouteGeometryProvider>) -> Self {
        Self { primary }
    }

    pub async fn resolve_or_waypoints(&self, waypoints: &[Position]) -> Vec<Position> {
        match self.primary.resolve(waypoints).await {
            Ok(line) if !line.is_empty() => line,
            Ok(_) => {
                warn!(target: "geometry", "routing service returned no geometry; using waypoints");
                waypoints.to_vec()
            }
            Err(err) => {
                warn!(target: "geometry", ?err, "routing service failed; using waypoints");
                waypoints.to_vec()
            }
        }
    }
}

#[async_trait]
impl RouteGeometryProvider for FallbackGeometry {
    async fn resolve(&self, waypoints: &[Position]) -> AppResult<Vec<Position>> {
        Ok(self.resolve_or_waypoints(waypoints).await)
    }
}
