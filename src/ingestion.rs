use std::io::Cursor;

use calamine::{open_workbook_from_rs, Reader, Xlsx};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::coords::{coerce_number, coerce_value};
use crate::errors::{AppError, AppResult};
use crate::models::Horario;
use crate::sql_dump::{insert_rows, InsertRow};

/// Accepted import formats, picked from the file extension alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportSource {
    Json,
    Csv,
    Xlsx,
    SqlDump,
}

impl ImportSource {
    pub fn detect(file_name: &str) -> AppResult<Self> {
        let lowered = file_name.trim().to_lowercase();
        let extension = lowered
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or(lowered.as_str());
        match extension {
            "json" => Ok(ImportSource::Json),
            "csv" => Ok(ImportSource::Csv),
            "xlsx" => Ok(ImportSource::Xlsx),
            "sql" => Ok(ImportSource::SqlDump),
            other => Err(AppError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            ImportSource::Json => "json",
            ImportSource::Csv => "csv",
            ImportSource::Xlsx => "xlsx",
            ImportSource::SqlDump => "sql",
        }
    }

    pub fn parse<R: RawRecord>(&self, bytes: &[u8]) -> AppResult<Vec<R>> {
        let records = match self {
            ImportSource::Json => {
                let parsed: Value = serde_json::from_slice(bytes)?;
                let items = match parsed {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                items
                    .iter()
                    .enumerate()
                    .filter_map(|(index, item)| match item.as_object() {
                        Some(object) => Some(object),
                        None => {
                            warn!(target: "import", index, "skipping JSON element that is not an object");
                            None
                        }
                    })
                    .map(R::from_json)
                    .collect()
            }
            ImportSource::Csv => read_csv_table(bytes)?.iter().map(R::from_row).collect(),
            ImportSource::Xlsx => read_xlsx_table(bytes)?.iter().map(R::from_row).collect(),
            ImportSource::SqlDump => {
                let text = std::str::from_utf8(bytes).map_err(|err| {
                    AppError::MalformedSource(format!("SQL dump is not valid UTF-8: {err}"))
                })?;
                R::from_sql_dump(text)?
            }
        };
        debug!(
            target: "import",
            format = self.as_tag(),
            records = records.len(),
            "parsed import source"
        );
        Ok(records)
    }
}

/// A per-format raw record that the payload builder turns into a canonical one.
pub trait RawRecord: Sized {
    fn from_json(object: &Map<String, Value>) -> Self;
    fn from_row(row: &TableRow) -> Self;
    fn from_sql_dump(text: &str) -> AppResult<Vec<Self>>;
}

/// One CSV or spreadsheet row keyed by the header line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRow {
    cells: Vec<(String, String)>,
}

impl TableRow {
    pub fn new<I, S>(headers: &[String], values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cells = headers
            .iter()
            .zip(values)
            .map(|(header, value)| (header.clone(), clean_cell(value.as_ref())))
            .collect();
        Self { cells }
    }

    /// Cell under `column`, or `None` when the row has no such column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(header, _)| header == column)
            .or_else(|| {
                self.cells
                    .iter()
                    .find(|(header, _)| header.eq_ignore_ascii_case(column))
            })
            .map(|(_, value)| value.as_str())
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|(_, value)| value.is_empty())
    }
}

fn clean_cell(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('"').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix('"').unwrap_or(trimmed);
    trimmed.trim().to_string()
}

/// First line is the header; quoted fields may hold commas. Blank lines are skipped.
pub fn read_csv_table(bytes: &[u8]) -> AppResult<Vec<TableRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let row = TableRow::new(&headers, record?.iter());
        if !row.is_blank() {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// First sheet only, row 0 as the header, empty rows skipped.
pub fn read_xlsx_table(bytes: &[u8]) -> AppResult<Vec<TableRow>> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes.to_vec()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AppError::MalformedSource("workbook has no sheets".into()))??;

    let mut lines = range.rows();
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header
        .iter()
        .map(|cell| cell.to_string().trim().to_string())
        .collect();

    Ok(lines
        .map(|cells| TableRow::new(&headers, cells.iter().map(|cell| cell.to_string())))
        .filter(|row| !row.is_blank())
        .collect())
}

/// Origin or destination as found in the source, before defaults apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEndpoint {
    pub nombre: Option<String>,
    /// Raw `[lng, lat]`, possibly axis-swapped. `None` means no coordinate object at all.
    pub coord: Option<[f64; 2]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawStop {
    pub nombre: String,
    pub lng: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRoute {
    pub nombre: String,
    pub municipio_id: Option<String>,
    pub municipio: String,
    pub empresa_id: Option<String>,
    pub empresa: String,
    pub origen: Option<RawEndpoint>,
    pub destino: Option<RawEndpoint>,
    pub paradas: Vec<RawStop>,
    pub horarios: Vec<Horario>,
    pub costo_minimo: f64,
    pub costo_maximo: f64,
    pub moneda: Option<String>,
    pub duracion: Option<String>,
    pub frecuencia: Option<String>,
    pub activa: Option<bool>,
    pub notas: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCompany {
    pub nombre: String,
    pub municipio_id: Option<String>,
    pub municipio: String,
    pub telefono: String,
    pub email: String,
    pub activa: Option<bool>,
}

/// `name|lng|lat` entries joined by `;`. Empty entries are skipped.
pub fn parse_stops(text: &str) -> Vec<RawStop> {
    text.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.split('|');
            let nombre = parts.next().unwrap_or_default().trim().to_string();
            let lng = coerce_number(parts.next());
            let lat = coerce_number(parts.next());
            RawStop { nombre, lng, lat }
        })
        .collect()
}

/// `true`, `1`, `si` and `sí` are truthy; blank or missing is `None`.
pub fn parse_flag(raw: Option<&str>) -> Option<bool> {
    let text = raw?.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    Some(matches!(text.as_str(), "true" | "1" | "si" | "sí"))
}

fn json_flag(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Null => None,
        Value::Bool(flag) => Some(*flag),
        Value::Number(n) => Some(n.as_f64().map(|v| v != 0.0).unwrap_or(false)),
        Value::String(text) => parse_flag(Some(text)),
        _ => Some(true),
    }
}

fn value_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn json_cost(value: Option<&Value>) -> f64 {
    match value {
        None | Some(Value::Null) => 0.0,
        some => coerce_value(some),
    }
}

fn text_cost(raw: Option<&str>) -> f64 {
    coerce_number(Some(raw.unwrap_or_default()))
}

/// Coordinates live either flat on the object (`lng`/`lat`) or under `coord`
/// as a `[lng, lat]` pair or a `{lng, lat}` object.
fn json_position(object: &Map<String, Value>) -> [f64; 2] {
    match object.get("coord") {
        Some(Value::Array(pair)) => [coerce_value(pair.first()), coerce_value(pair.get(1))],
        Some(Value::Object(inner)) => [coerce_value(inner.get("lng")), coerce_value(inner.get("lat"))],
        _ => [coerce_value(object.get("lng")), coerce_value(object.get("lat"))],
    }
}

fn json_endpoint(value: Option<&Value>) -> Option<RawEndpoint> {
    match value? {
        Value::String(name) => Some(RawEndpoint {
            nombre: non_empty(name.trim().to_string()),
            coord: None,
        }),
        Value::Object(object) => Some(RawEndpoint {
            nombre: non_empty(value_text(object.get("nombre"))),
            coord: Some(json_position(object)),
        }),
        _ => None,
    }
}

fn json_stop(value: &Value) -> RawStop {
    match value {
        Value::Object(object) => {
            let [lng, lat] = json_position(object);
            RawStop {
                nombre: value_text(object.get("nombre")),
                lng,
                lat,
            }
        }
        other => RawStop {
            nombre: value_text(Some(other)),
            lng: f64::NAN,
            lat: f64::NAN,
        },
    }
}

fn json_horarios(value: Option<&Value>) -> Vec<Horario> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| Horario {
                    dia: value_text(item.get("dia")),
                    salidas: item
                        .get("salidas")
                        .and_then(Value::as_array)
                        .map(|times| times.iter().map(|t| value_text(Some(t))).collect())
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn explicit_id(object: &Map<String, Value>, camel: &str, snake: &str) -> Option<String> {
    non_empty(value_text(object.get(camel).or_else(|| object.get(snake))))
}

fn table_endpoint(row: &TableRow, prefix: &str) -> RawEndpoint {
    RawEndpoint {
        nombre: row.get(&format!("{prefix}_nombre")).map(str::to_string),
        coord: Some([
            coerce_number(row.get(&format!("{prefix}_lng"))),
            coerce_number(row.get(&format!("{prefix}_lat"))),
        ]),
    }
}

fn sql_endpoint(row: &InsertRow, prefix: &str) -> Option<RawEndpoint> {
    let nombre = row.get(&format!("{prefix}_nombre"));
    let lng = row.get(&format!("{prefix}_lng"));
    let lat = row.get(&format!("{prefix}_lat"));
    if nombre.is_none() && lng.is_none() && lat.is_none() {
        return None;
    }
    Some(RawEndpoint {
        nombre: nombre.map(str::to_string),
        coord: Some([coerce_number(lng), coerce_number(lat)]),
    })
}

fn stop_endpoint(stop: &RawStop) -> RawEndpoint {
    RawEndpoint {
        nombre: Some(stop.nombre.clone()),
        coord: Some([stop.lng, stop.lat]),
    }
}

impl RawRecord for RawRoute {
    fn from_json(object: &Map<String, Value>) -> Self {
        RawRoute {
            nombre: value_text(object.get("nombre")),
            municipio_id: explicit_id(object, "municipioId", "municipio_id"),
            municipio: value_text(object.get("municipio")),
            empresa_id: explicit_id(object, "empresaId", "empresa_id"),
            empresa: value_text(object.get("empresa")),
            origen: json_endpoint(object.get("origen")),
            destino: json_endpoint(object.get("destino")),
            paradas: object
                .get("paradas")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(json_stop).collect())
                .unwrap_or_default(),
            horarios: json_horarios(object.get("horarios")),
            costo_minimo: json_cost(object.get("costoMinimo")),
            costo_maximo: json_cost(object.get("costoMaximo")),
            moneda: non_empty(value_text(object.get("moneda"))),
            duracion: non_empty(value_text(object.get("duracion"))),
            frecuencia: non_empty(value_text(object.get("frecuencia"))),
            activa: json_flag(object.get("activa")),
            notas: non_empty(value_text(object.get("notas"))),
        }
    }

    fn from_row(row: &TableRow) -> Self {
        let text = |column: &str| row.get(column).map(str::to_string).and_then(non_empty);
        RawRoute {
            nombre: row.get("nombre").unwrap_or_default().to_string(),
            municipio_id: text("municipioId"),
            municipio: row.get("municipio").unwrap_or_default().to_string(),
            empresa_id: text("empresaId"),
            empresa: row.get("empresa").unwrap_or_default().to_string(),
            origen: Some(table_endpoint(row, "origen")),
            destino: Some(table_endpoint(row, "destino")),
            paradas: parse_stops(row.get("stops").unwrap_or_default()),
            horarios: Vec::new(),
            costo_minimo: text_cost(row.get("costoMinimo")),
            costo_maximo: text_cost(row.get("costoMaximo")),
            moneda: text("moneda"),
            duracion: text("duracion"),
            frecuencia: text("frecuencia"),
            activa: parse_flag(row.get("activa")),
            notas: text("notas"),
        }
    }

    fn from_sql_dump(text: &str) -> AppResult<Vec<Self>> {
        let route = insert_rows(text, "rutas").into_iter().next().ok_or_else(|| {
            AppError::MalformedSource("no INSERT INTO rutas statement found".into())
        })?;
        let stops: Vec<RawStop> = insert_rows(text, "paradas")
            .iter()
            .map(|row| RawStop {
                nombre: row
                    .get_or_positional("nombre", 1)
                    .unwrap_or_default()
                    .to_string(),
                lng: coerce_number(row.get_or_positional("coordenada_lng", 3)),
                lat: coerce_number(row.get_or_positional("coordenada_lat", 4)),
            })
            .collect();

        let text_of = |column: &str| route.get(column).map(str::to_string).and_then(non_empty);
        let origen = sql_endpoint(&route, "origen").or_else(|| stops.first().map(stop_endpoint));
        let destino = sql_endpoint(&route, "destino").or_else(|| stops.last().map(stop_endpoint));

        Ok(vec![RawRoute {
            nombre: route.get("nombre").unwrap_or_default().to_string(),
            municipio_id: text_of("municipio_id"),
            municipio: route.get("municipio").unwrap_or_default().to_string(),
            empresa_id: text_of("empresa_id"),
            empresa: route.get("empresa").unwrap_or_default().to_string(),
            origen,
            destino,
            paradas: stops,
            horarios: Vec::new(),
            costo_minimo: text_cost(route.get("costo_minimo")),
            costo_maximo: text_cost(route.get("costo_maximo")),
            moneda: text_of("moneda"),
            duracion: text_of("duracion"),
            frecuencia: text_of("frecuencia"),
            activa: parse_flag(route.get("activa")),
            notas: text_of("notas"),
        }])
    }
}

impl RawRecord for RawCompany {
    fn from_json(object: &Map<String, Value>) -> Self {
        RawCompany {
            nombre: value_text(object.get("nombre")),
            municipio_id: explicit_id(object, "municipioId", "municipio_id"),
            municipio: value_text(object.get("municipio")),
            telefono: value_text(object.get("telefono")),
            email: value_text(object.get("email")),
            activa: json_flag(object.get("activa")),
        }
    }

    fn from_row(row: &TableRow) -> Self {
        RawCompany {
            nombre: row.get("nombre").unwrap_or_default().to_string(),
            municipio_id: row
                .get("municipioId")
                .map(str::to_string)
                .and_then(non_empty),
            municipio: row.get("municipio").unwrap_or_default().to_string(),
            telefono: row.get("telefono").unwrap_or_default().to_string(),
            email: row.get("email").unwrap_or_default().to_string(),
            activa: parse_flag(row.get("activa")),
        }
    }

    fn from_sql_dump(text: &str) -> AppResult<Vec<Self>> {
        let rows = insert_rows(text, "empresas");
        if rows.is_empty() {
            return Err(AppError::MalformedSource(
                "no INSERT INTO empresas statement found".into(),
            ));
        }
        Ok(rows
            .iter()
            .map(|row| {
                let text_of = |column: &str| row.get(column).unwrap_or_default().trim().to_string();
                RawCompany {
                    nombre: text_of("nombre"),
                    municipio_id: non_empty(text_of("municipio_id")),
                    municipio: text_of("municipio"),
                    telefono: text_of("telefono"),
                    email: text_of("email"),
                    activa: parse_flag(row.get("activa")),
                }
            })
            .collect())
    }
}
