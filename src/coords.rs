use serde_json::Value;

/// `[lng, lat]`, the order the backend and the routing service both use.
pub type Position = [f64; 2];

pub const ORIGIN_FALLBACK: Position = [0.0, 0.0];

/// Tolerant text-to-number coercion.
///
/// Empty text is `0`. A missing field or text that is not a number is `NaN`;
/// callers let it propagate instead of rejecting the row.
pub fn coerce_number(raw: Option<&str>) -> f64 {
    match raw.map(str::trim) {
        None => f64::NAN,
        Some("") => 0.0,
        Some(text) => text.parse::<f64>().unwrap_or(f64::NAN),
    }
}

/// Same rules as [`coerce_number`] for loosely typed JSON values.
pub fn coerce_value(raw: Option<&Value>) -> f64 {
    match raw {
        None | Some(Value::Null) => f64::NAN,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => coerce_number(Some(s)),
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(_) => f64::NAN,
    }
}

/// Swaps axes when the input clearly arrived as `lat, lng`.
///
/// Only catches the case where the latitude slot is out of range and the
/// longitude slot is not; swaps with both values under 90 go unnoticed.
pub fn normalize_coordinate(lng: f64, lat: f64) -> Position {
    if lat.abs() > 90.0 && lng.abs() < 90.0 {
        [lat, lng]
    } else {
        [lng, lat]
    }
}

pub fn is_finite_position(position: &Position) -> bool {
    position[0].is_finite() && position[1].is_finite()
}
