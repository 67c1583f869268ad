use tracing::debug;

use crate::catalog::FieldResolver;
use crate::coords::{normalize_coordinate, Position, ORIGIN_FALLBACK};
use crate::errors::{AppError, AppResult, ReferenceKind};
use crate::ingestion::{RawCompany, RawEndpoint, RawRoute, RawStop};
use crate::models::{CompanyRecord, RouteRecord};

const DEFAULT_ORIGIN_NAME: &str = "Origen";
const DEFAULT_DESTINATION_NAME: &str = "Destino";
const DEFAULT_CURRENCY: &str = "MXN";

/// Turns raw per-format records into create bodies, resolving names to ids.
#[derive(Clone)]
pub struct PayloadBuilder {
    resolver: FieldResolver,
}

impl PayloadBuilder {
    pub fn new(resolver: FieldResolver) -> Self {
        Self { resolver }
    }

    /// Fails with `UnresolvedReference` when the municipality or company is unknown.
    pub async fn build_route(&self, raw: &RawRoute) -> AppResult<RouteRecord> {
        let municipio_id = self
            .resolver
            .municipio_id(raw.municipio_id.as_deref(), &raw.municipio)
            .await
            .ok_or_else(|| AppError::UnresolvedReference {
                kind: ReferenceKind::Municipality,
                name: raw.municipio.clone(),
            })?;
        let empresa_id = self
            .resolver
            .empresa_id(&municipio_id, raw.empresa_id.as_deref(), &raw.empresa)
            .await
            .ok_or_else(|| AppError::UnresolvedReference {
                kind: ReferenceKind::Company,
                name: raw.empresa.clone(),
            })?;
        debug!(
            target: "import",
            route = %raw.nombre,
            %municipio_id,
            %empresa_id,
            "route references resolved"
        );
        Ok(assemble_route(raw, municipio_id, empresa_id))
    }

    pub async fn build_company(&self, raw: &RawCompany) -> CompanyRecord {
        let municipio_id = self
            .resolver
            .municipio_id_or_default(raw.municipio_id.as_deref(), &raw.municipio)
            .await;
        assemble_company(raw, municipio_id)
    }
}

/// Pure half of the route builder: ids are already known.
pub fn assemble_route(raw: &RawRoute, municipio_id: String, empresa_id: String) -> RouteRecord {
    let (origen, origin_coord) = endpoint(raw.origen.as_ref(), DEFAULT_ORIGIN_NAME);
    let (destino, destination_coord) = endpoint(raw.destino.as_ref(), DEFAULT_DESTINATION_NAME);
    let (paradas, coordenadas) = assemble_stops(
        (origen.as_str(), origin_coord),
        &raw.paradas,
        (destino.as_str(), destination_coord),
    );

    RouteRecord {
        nombre: raw.nombre.trim().to_string(),
        origen,
        destino,
        municipio_id,
        empresa_id,
        costo_minimo: raw.costo_minimo,
        costo_maximo: raw.costo_maximo,
        moneda: raw
            .moneda
            .clone()
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        duracion: raw.duracion.clone().unwrap_or_default(),
        frecuencia: raw.frecuencia.clone().unwrap_or_default(),
        activa: raw.activa.unwrap_or(true),
        notas: raw.notas.clone().unwrap_or_default(),
        paradas,
        coordenadas,
        horarios: raw.horarios.clone(),
    }
}

pub fn assemble_company(raw: &RawCompany, municipio_id: String) -> CompanyRecord {
    let optional = |text: &str| {
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    };
    let municipio_label = optional(&raw.municipio).unwrap_or_else(|| municipio_id.clone());
    CompanyRecord {
        nombre: raw.nombre.trim().to_string(),
        municipio_id,
        telefono: optional(&raw.telefono),
        email: optional(&raw.email),
        activa: raw.activa.unwrap_or(true),
        municipio_label,
    }
}

/// `[origin, ...middle, destination]` names with a parallel coordinate list.
pub fn assemble_stops(
    origin: (&str, Position),
    middle: &[RawStop],
    destination: (&str, Position),
) -> (Vec<String>, Vec<Position>) {
    let mut paradas = Vec::with_capacity(middle.len() + 2);
    let mut coordenadas = Vec::with_capacity(middle.len() + 2);

    paradas.push(origin.0.to_string());
    coordenadas.push(origin.1);
    for stop in middle {
        paradas.push(stop.nombre.clone());
        coordenadas.push(normalize_coordinate(stop.lng, stop.lat));
    }
    paradas.push(destination.0.to_string());
    coordenadas.push(destination.1);

    (paradas, coordenadas)
}

fn endpoint(raw: Option<&RawEndpoint>, fallback_name: &str) -> (String, Position) {
    let name = raw
        .and_then(|endpoint| endpoint.nombre.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(fallback_name)
        .to_string();
    let coord = raw
        .and_then(|endpoint| endpoint.coord)
        .map(|[lng, lat]| normalize_coordinate(lng, lat))
        .unwrap_or(ORIGIN_FALLBACK);
    (name, coord)
}
