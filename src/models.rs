use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::coords::{coerce_value, Position};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Municipio {
    pub id: String,
    pub nombre: String,
    #[serde(default)]
    pub centro: Option<LngLat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmpresaPublica {
    pub id: String,
    pub nombre: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RutaPublica {
    pub id: String,
    pub nombre: String,
    #[serde(default)]
    pub origen: String,
    #[serde(default)]
    pub destino: String,
    #[serde(default)]
    pub empresa_id: Option<String>,
    #[serde(default)]
    pub costo_minimo: Option<f64>,
    #[serde(default)]
    pub costo_maximo: Option<f64>,
    #[serde(default)]
    pub moneda: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Horario {
    pub dia: String,
    #[serde(default)]
    pub salidas: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RutaDetails {
    pub id: String,
    pub nombre: String,
    #[serde(default)]
    pub origen: String,
    #[serde(default)]
    pub destino: String,
    #[serde(default)]
    pub costo_minimo: f64,
    #[serde(default)]
    pub costo_maximo: f64,
    #[serde(default)]
    pub moneda: String,
    #[serde(default)]
    pub duracion: String,
    #[serde(default)]
    pub frecuencia: String,
    #[serde(default)]
    pub paradas: Vec<String>,
    #[serde(default, deserialize_with = "lenient_positions")]
    pub coordenadas: Vec<Position>,
    #[serde(default)]
    pub horarios: Vec<Horario>,
    #[serde(default)]
    pub notas: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RutaAdmin {
    pub id: String,
    pub nombre: String,
    #[serde(default)]
    pub origen: String,
    #[serde(default)]
    pub destino: String,
    #[serde(default)]
    pub municipio: String,
    #[serde(default)]
    pub empresa: String,
    #[serde(default)]
    pub costo_minimo: f64,
    #[serde(default)]
    pub costo_maximo: f64,
    #[serde(default)]
    pub moneda: String,
    #[serde(default)]
    pub paradas: Vec<String>,
    #[serde(default, deserialize_with = "lenient_positions")]
    pub coordenadas: Vec<Position>,
    #[serde(default)]
    pub horarios: Vec<Horario>,
    #[serde(default)]
    pub activa: bool,
    #[serde(default)]
    pub notas: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmpresaAdmin {
    pub id: String,
    pub nombre: String,
    #[serde(default)]
    pub municipio_id: String,
    #[serde(default)]
    pub telefono: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub activa: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsuarioAdmin {
    pub id: String,
    pub nombre: String,
    pub email: String,
    #[serde(default)]
    pub telefono: Option<String>,
    #[serde(default)]
    pub tipo_usuario: String,
    #[serde(default)]
    pub rutas_registradas: u32,
    #[serde(default)]
    pub activo: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedStatus {
    #[serde(default)]
    pub guardada: bool,
    #[serde(default)]
    pub favorita: bool,
}

/// Canonical route record, ready to be posted as a create body.
///
/// `paradas` starts with `origen` and ends with `destino`; `coordenadas` is
/// parallel to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    pub nombre: String,
    pub origen: String,
    pub destino: String,
    pub municipio_id: String,
    pub empresa_id: String,
    pub costo_minimo: f64,
    pub costo_maximo: f64,
    pub moneda: String,
    pub duracion: String,
    pub frecuencia: String,
    pub activa: bool,
    pub notas: String,
    pub paradas: Vec<String>,
    pub coordenadas: Vec<Position>,
    pub horarios: Vec<Horario>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRecord {
    pub nombre: String,
    pub municipio_id: String,
    pub telefono: Option<String>,
    pub email: Option<String>,
    pub activa: bool,
    /// What the preview shows in the municipality column.
    #[serde(skip)]
    pub municipio_label: String,
}

/// Partial update body for `PUT /admin/rutas/:id`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nombre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destino: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub municipio_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empresa_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub costo_minimo: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub costo_maximo: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activa: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paradas: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordenadas: Option<Vec<Position>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horarios: Option<Vec<Horario>>,
}

/// Partial update body for `PUT /admin/empresas/:id`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nombre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub municipio_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telefono: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activa: Option<bool>,
}

// The backend occasionally stores nulls inside coordinate pairs; they become
// NaN so the draw path can filter them instead of failing the whole fetch.
fn lenient_positions<'de, D>(deserializer: D) -> Result<Vec<Position>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .iter()
        .map(|pair| match pair.as_array() {
            Some(items) => [coerce_value(items.first()), coerce_value(items.get(1))],
            None => [f64::NAN, f64::NAN],
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn route_record_serializes_camel_case() {
        let record = RouteRecord {
            nombre: "R1".into(),
            origen: "X".into(),
            destino: "Y".into(),
            municipio_id: "m1".into(),
            empresa_id: "e1".into(),
            costo_minimo: 8.0,
            costo_maximo: 12.0,
            moneda: "MXN".into(),
            duracion: String::new(),
            frecuencia: String::new(),
            activa: true,
            notas: String::new(),
            paradas: vec!["X".into(), "Y".into()],
            coordenadas: vec![[-97.9, 19.3], [-97.8, 19.2]],
            horarios: Vec::new(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["municipioId"], "m1");
        assert_eq!(value["costoMinimo"], 8.0);
        assert_eq!(value["coordenadas"][1][0], -97.8);
    }

    #[test]
    fn company_record_keeps_null_contacts() {
        let record = CompanyRecord {
            nombre: "ACME".into(),
            municipio_id: "m1".into(),
            telefono: None,
            email: Some("a@acme.mx".into()),
            activa: true,
            municipio_label: "Huamantla".into(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value["telefono"].is_null());
        assert!(value.get("municipioLabel").is_none());
    }

    #[test]
    fn details_tolerate_null_coordinates() {
        let details: RutaDetails = serde_json::from_value(json!({
            "id": "r1",
            "nombre": "Centro",
            "paradas": ["A", "B"],
            "coordenadas": [[-97.9, 19.3], [null, 19.2]]
        }))
        .unwrap();
        assert_eq!(details.coordenadas[0], [-97.9, 19.3]);
        assert!(details.coordenadas[1][0].is_nan());
        assert!(details.horarios.is_empty());
    }

    #[test]
    fn update_bodies_skip_unset_fields() {
        let update = CompanyUpdate {
            activa: Some(false),
            telefono: Some(None),
            ..CompanyUpdate::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value, json!({ "activa": false, "telefono": null }));
    }
}
