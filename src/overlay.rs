use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::coords::{is_finite_position, Position};
use crate::errors::{AppError, AppResult};
use crate::models::RutaDetails;

pub const SOURCE_PREFIX: &str = "route-source-";
pub const LAYER_PREFIX: &str = "route-line-";
pub const EVEN_COLOR: &str = "#FFD700";
pub const ODD_COLOR: &str = "#00BFFF";
pub const FIT_PADDING: u32 = 60;
pub const MIN_FOCUS_ZOOM: f64 = 14.0;

pub type MarkerId = u64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerSpec {
    pub label: String,
    pub popup: String,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub south_west: Position,
    pub north_east: Position,
}

impl Bounds {
    /// `None` for an empty slice.
    pub fn around(points: &[Position]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut bounds = Bounds {
            south_west: *first,
            north_east: *first,
        };
        for [lng, lat] in rest {
            bounds.south_west = [bounds.south_west[0].min(*lng), bounds.south_west[1].min(*lat)];
            bounds.north_east = [bounds.north_east[0].max(*lng), bounds.north_east[1].max(*lat)];
        }
        Some(bounds)
    }
}

/// The slice of a web map the route overlay drives. Calls are synchronous;
/// implementations report failures per call.
pub trait MapSurface: Send {
    fn source_ids(&self) -> Vec<String>;
    fn layer_ids(&self) -> Vec<String>;
    fn has_source(&self, id: &str) -> bool;
    fn has_layer(&self, id: &str) -> bool;
    fn add_line_source(&mut self, id: &str, line: &[Position]) -> AppResult<()>;
    fn set_source_data(&mut self, id: &str, line: &[Position]) -> AppResult<()>;
    fn remove_source(&mut self, id: &str) -> AppResult<()>;
    fn add_line_layer(&mut self, id: &str, source_id: &str, color: &str) -> AppResult<()>;
    fn set_line_color(&mut self, id: &str, color: &str) -> AppResult<()>;
    fn remove_layer(&mut self, id: &str) -> AppResult<()>;
    fn add_marker(&mut self, marker: &MarkerSpec) -> AppResult<MarkerId>;
    fn remove_marker(&mut self, id: MarkerId) -> AppResult<()>;
    fn zoom(&self) -> f64;
    fn fly_to(&mut self, center: Position, zoom: f64) -> AppResult<()>;
    fn fit_bounds(&mut self, bounds: Bounds, padding: u32) -> AppResult<()>;
}

pub fn source_id(route_id: &str) -> String {
    format!("{SOURCE_PREFIX}{route_id}")
}

pub fn layer_id(route_id: &str) -> String {
    format!("{LAYER_PREFIX}{route_id}")
}

/// Alternates by the parity of the id's last character code.
pub fn line_color(route_id: &str) -> &'static str {
    match route_id.chars().last() {
        Some(last) if u32::from(last) % 2 == 0 => EVEN_COLOR,
        _ => ODD_COLOR,
    }
}

fn log_failure<T>(op: &str, id: &str, result: AppResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target: "overlay", op, id, ?err, "map call failed");
            None
        }
    }
}

/// Markers placed for the current route.
#[derive(Debug, Default)]
pub struct MarkerManager {
    placed: Vec<MarkerId>,
}

impl MarkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.placed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placed.is_empty()
    }

    pub fn clear(&mut self, map: &mut dyn MapSurface) {
        for id in self.placed.drain(..) {
            log_failure("remove_marker", &id.to_string(), map.remove_marker(id));
        }
    }

    /// One marker per named stop, numbered from 1.
    pub fn place(&mut self, map: &mut dyn MapSurface, names: &[String], positions: &[Position]) {
        for (index, (name, position)) in names.iter().zip(positions).enumerate() {
            let spec = MarkerSpec {
                label: (index + 1).to_string(),
                popup: name.clone(),
                position: *position,
            };
            if let Some(id) = log_failure("add_marker", name, map.add_marker(&spec)) {
                self.placed.push(id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawOutcome {
    Drawn { points: usize, markers: usize },
    NothingToDraw,
}

/// Keeps exactly one route source and line layer on the map.
#[derive(Debug, Default)]
pub struct MapLayerSync {
    markers: MarkerManager,
}

impl MapLayerSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn markers(&self) -> &MarkerManager {
        &self.markers
    }

    pub fn draw(
        &mut self,
        map: &mut dyn MapSurface,
        details: &RutaDetails,
        line: &[Position],
    ) -> DrawOutcome {
        self.markers.clear(map);

        let points: Vec<Position> = line.iter().copied().filter(is_finite_position).collect();
        if points.is_empty() {
            debug!(target: "overlay", route = %details.id, "no finite coordinates to draw");
            return DrawOutcome::NothingToDraw;
        }

        let source = source_id(&details.id);
        let layer = layer_id(&details.id);
        remove_route_overlays(map, Some(&details.id));

        if map.has_source(&source) {
            log_failure("set_source_data", &source, map.set_source_data(&source, &points));
        } else {
            log_failure("add_source", &source, map.add_line_source(&source, &points));
        }
        let color = line_color(&details.id);
        if map.has_layer(&layer) {
            log_failure("set_line_color", &layer, map.set_line_color(&layer, color));
        } else {
            log_failure("add_layer", &layer, map.add_line_layer(&layer, &source, color));
        }

        let stops: Vec<Position> = details
            .coordenadas
            .iter()
            .copied()
            .filter(is_finite_position)
            .collect();
        self.markers.place(map, &details.paradas, &stops);

        if let [only] = points.as_slice() {
            let zoom = map.zoom().max(MIN_FOCUS_ZOOM);
            log_failure("fly_to", &details.id, map.fly_to(*only, zoom));
        } else if let Some(bounds) = Bounds::around(&points) {
            log_failure("fit_bounds", &details.id, map.fit_bounds(bounds, FIT_PADDING));
        }

        debug!(
            target: "overlay",
            route = %details.id,
            points = points.len(),
            markers = self.markers.len(),
            "route overlay drawn"
        );
        DrawOutcome::Drawn {
            points: points.len(),
            markers: self.markers.len(),
        }
    }

    /// Removes every route overlay and marker.
    pub fn clear(&mut self, map: &mut dyn MapSurface) {
        self.markers.clear(map);
        remove_route_overlays(map, None);
    }
}

/// Layers go before their sources. `keep` spares one route's pair.
fn remove_route_overlays(map: &mut dyn MapSurface, keep: Option<&str>) {
    let keep_layer = keep.map(layer_id);
    let keep_source = keep.map(source_id);
    for id in map.layer_ids() {
        if id.starts_with(LAYER_PREFIX) && Some(&id) != keep_layer.as_ref() {
            log_failure("remove_layer", &id, map.remove_layer(&id));
        }
    }
    for id in map.source_ids() {
        if id.starts_with(SOURCE_PREFIX) && Some(&id) != keep_source.as_ref() {
            log_failure("remove_source", &id, map.remove_source(&id));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineLayer {
    pub source: String,
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Camera {
    FlyTo { center: Position, zoom: f64 },
    FitBounds { bounds: Bounds, padding: u32 },
}

/// In-memory map surface. Useful off-screen and in tests.
#[derive(Debug)]
pub struct HeadlessMap {
    sources: BTreeMap<String, Vec<Position>>,
    layers: BTreeMap<String, LineLayer>,
    markers: BTreeMap<MarkerId, MarkerSpec>,
    next_marker: MarkerId,
    zoom: f64,
    camera: Option<Camera>,
    failing: HashSet<&'static str>,
}

impl Default for HeadlessMap {
    fn default() -> Self {
        Self {
            sources: BTreeMap::new(),
            layers: BTreeMap::new(),
            markers: BTreeMap::new(),
            next_marker: 1,
            zoom: 12.0,
            camera: None,
            failing: HashSet::new(),
        }
    }
}

impl HeadlessMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zoom(mut self, zoom: f64) -> Self {
        self.zoom = zoom;
        self
    }

    /// Makes every call of the named operation fail, e.g. `"add_marker"`.
    pub fn failing(mut self, op: &'static str) -> Self {
        self.failing.insert(op);
        self
    }

    pub fn source(&self, id: &str) -> Option<&[Position]> {
        self.sources.get(id).map(Vec::as_slice)
    }

    pub fn layer(&self, id: &str) -> Option<&LineLayer> {
        self.layers.get(id)
    }

    pub fn markers(&self) -> Vec<&MarkerSpec> {
        self.markers.values().collect()
    }

    pub fn camera(&self) -> Option<Camera> {
        self.camera
    }

    fn check(&self, op: &'static str, id: &str) -> AppResult<()> {
        if self.failing.contains(op) {
            return Err(AppError::Map(format!("{op} failed for {id}")));
        }
        Ok(())
    }
}

impl MapSurface for HeadlessMap {
    fn source_ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    fn layer_ids(&self) -> Vec<String> {
        self.layers.keys().cloned().collect()
    }

    fn has_source(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    fn has_layer(&self, id: &str) -> bool {
        self.layers.contains_key(id)
    }

    fn add_line_source(&mut self, id: &str, line: &[Position]) -> AppResult<()> {
        self.check("add_source", id)?;
        if self.sources.contains_key(id) {
            return Err(AppError::Map(format!("source {id} already exists")));
        }
        self.sources.insert(id.to_string(), line.to_vec());
        Ok(())
    }

    fn set_source_data(&mut self, id: &str, line: &[Position]) -> AppResult<()> {
        self.check("set_source_data", id)?;
        let data = self
            .sources
            .get_mut(id)
            .ok_or_else(|| AppError::Map(format!("unknown source {id}")))?;
        *data = line.to_vec();
        Ok(())
    }

    fn remove_source(&mut self, id: &str) -> AppResult<()> {
        self.check("remove_source", id)?;
        if self.layers.values().any(|layer| layer.source == id) {
            return Err(AppError::Map(format!("source {id} is still in use")));
        }
        self.sources.remove(id);
        Ok(())
    }

    fn add_line_layer(&mut self, id: &str, source_id: &str, color: &str) -> AppResult<()> {
        self.check("add_layer", id)?;
        if !self.sources.contains_key(source_id) {
            return Err(AppError::Map(format!("layer {id} needs missing source {source_id}")));
        }
        self.layers.insert(
            id.to_string(),
            LineLayer {
                source: source_id.to_string(),
                color: color.to_string(),
            },
        );
        Ok(())
    }

    fn set_line_color(&mut self, id: &str, color: &str) -> AppResult<()> {
        self.check("set_line_color", id)?;
        let layer = self
            .layers
            .get_mut(id)
            .ok_or_else(|| AppError::Map(format!("unknown layer {id}")))?;
        layer.color = color.to_string();
        Ok(())
    }

    fn remove_layer(&mut self, id: &str) -> AppResult<()> {
        self.check("remove_layer", id)?;
        self.layers.remove(id);
        Ok(())
    }

    fn add_marker(&mut self, marker: &MarkerSpec) -> AppResult<MarkerId> {
        self.check("add_marker", &marker.label)?;
        let id = self.next_marker;
        self.next_marker += 1;
        self.markers.insert(id, marker.clone());
        Ok(id)
    }

    fn remove_marker(&mut self, id: MarkerId) -> AppResult<()> {
        self.check("remove_marker", &id.to_string())?;
        self.markers.remove(&id);
        Ok(())
    }

    fn zoom(&self) -> f64 {
        self.zoom
    }

    fn fly_to(&mut self, center: Position, zoom: f64) -> AppResult<()> {
        self.check("fly_to", "camera")?;
        self.zoom = zoom;
        self.camera = Some(Camera::FlyTo { center, zoom });
        Ok(())
    }

    fn fit_bounds(&mut self, bounds: Bounds, padding: u32) -> AppResult<()> {
        self.check("fit_bounds", "camera")?;
        self.camera = Some(Camera::FitBounds { bounds, padding });
        Ok(())
    }
}
