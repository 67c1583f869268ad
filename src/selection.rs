use std::sync::Arc;

use futures_util::future::{AbortHandle, AbortRegistration, Abortable};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backend::RouteDetailsSource;
use crate::coords::{is_finite_position, Position};
use crate::errors::{AppError, AppResult};
use crate::geometry::RouteGeometryProvider;
use crate::models::{RutaDetails, SavedStatus};
use crate::overlay::{DrawOutcome, MapLayerSync, MapSurface};
use crate::telemetry::{TelemetryClient, TelemetryKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPhase {
    Idle,
    Fetching,
    Drawn,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionOutcome {
    /// Another selection held the guard.
    Ignored,
    Drawn { draw: DrawOutcome },
    Failed { message: String },
    /// Aborted by a newer load or by `clear`.
    Cancelled,
    /// Finished after a newer load had started.
    Superseded,
}

struct SelectionState {
    active_route: Option<String>,
    details: Option<RutaDetails>,
    saved: SavedStatus,
    phase: SelectionPhase,
    generation: u64,
    abort: Option<AbortHandle>,
    drawn_by_handler: Option<String>,
    selecting: bool,
    last_error: Option<String>,
}

impl SelectionState {
    fn idle() -> Self {
        Self {
            active_route: None,
            details: None,
            saved: SavedStatus::default(),
            phase: SelectionPhase::Idle,
            generation: 0,
            abort: None,
            drawn_by_handler: None,
            selecting: false,
            last_error: None,
        }
    }

    /// Runs only for the completion whose ticket is still current.
    fn finish(&mut self) {
        self.selecting = false;
        self.abort = None;
    }
}

/// Settles a load that ended without `complete` or `fail`: dropped by its
/// caller, or cancelled from inside the fetch. Stale tickets are left alone.
struct PendingLoad<'a> {
    state: &'a Mutex<SelectionState>,
    ticket: u64,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.generation != self.ticket || state.phase != SelectionPhase::Fetching {
            return;
        }
        if let Some(handle) = state.abort.take() {
            handle.abort();
        }
        state.phase = SelectionPhase::Idle;
        state.finish();
        debug!(target: "selection", ticket = self.ticket, "unfinished route load released");
    }
}

struct MapView<M> {
    surface: M,
    sync: MapLayerSync,
}

struct FetchedRoute {
    details: RutaDetails,
    saved: SavedStatus,
    line: Vec<Position>,
}

/// Owns the selected route and keeps the map overlay in step with it.
/// At most one details fetch is live; a newer load aborts the older one.
pub struct SelectionController<M: MapSurface> {
    source: Arc<dyn RouteDetailsSource>,
    geometry: Arc<dyn RouteGeometryProvider>,
    telemetry: Option<TelemetryClient>,
    state: Mutex<SelectionState>,
    map: Mutex<MapView<M>>,
}

impl<M: MapSurface> SelectionController<M> {
    pub fn new(
        source: Arc<dyn RouteDetailsSource>,
        geometry: Arc<dyn RouteGeometryProvider>,
        surface: M,
    ) -> Self {
        Self {
            source,
            geometry,
            telemetry: None,
            state: Mutex::new(SelectionState::idle()),
            map: Mutex::new(MapView {
                surface,
                sync: MapLayerSync::new(),
            }),
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryClient) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// User path. Ignored while another selection is running; otherwise the
    /// map is cleared and the route loaded.
    pub async fn select(&self, route_id: &str) -> SelectionOutcome {
        {
            let mut state = self.state.lock();
            if state.selecting {
                debug!(target: "selection", route_id, "selection already in progress; ignoring");
                return SelectionOutcome::Ignored;
            }
            state.selecting = true;
        }
        {
            let mut view = self.map.lock();
            let MapView { surface, sync } = &mut *view;
            sync.clear(surface);
        }
        self.load(route_id).await
    }

    /// Supersede path: aborts whatever is in flight and loads `route_id`.
    ///
    /// Dropping the returned future before it resolves releases the
    /// selection guard, as long as no newer load has taken over.
    pub async fn load(&self, route_id: &str) -> SelectionOutcome {
        let (ticket, registration) = self.begin(route_id);
        let _pending = PendingLoad {
            state: &self.state,
            ticket,
        };
        self.record_event(TelemetryKind::RouteSelected, json!({ "route_id": route_id }));

        let fetched = match Abortable::new(self.fetch_route(route_id), registration).await {
            Ok(result) => result,
            Err(_aborted) => {
                debug!(target: "selection", route_id, ticket, "route load aborted");
                return SelectionOutcome::Cancelled;
            }
        };

        match fetched {
            Ok(route) => self.complete(ticket, route),
            // Settled by `PendingLoad` when the ticket is still current.
            Err(AppError::Cancelled) => SelectionOutcome::Cancelled,
            Err(err) => self.fail(ticket, route_id, err),
        }
    }

    /// Reactive draw. Skips once right after the load handler drew the same route.
    pub async fn redraw(&self) -> Option<DrawOutcome> {
        let (ticket, details) = {
            let mut state = self.state.lock();
            let active = state.active_route.clone()?;
            if state.drawn_by_handler.as_deref() == Some(active.as_str()) {
                state.drawn_by_handler = None;
                return None;
            }
            (state.generation, state.details.clone()?)
        };

        let line = self.resolve_line(&finite_waypoints(&details)).await;

        let state = self.state.lock();
        if state.generation != ticket {
            return None;
        }
        Some(self.draw(&details, &line))
    }

    /// Aborts any load, tears down every overlay and returns to idle.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            if let Some(handle) = state.abort.take() {
                handle.abort();
            }
            let generation = state.generation + 1;
            *state = SelectionState {
                generation,
                ..SelectionState::idle()
            };
        }
        {
            let mut view = self.map.lock();
            let MapView { surface, sync } = &mut *view;
            sync.clear(surface);
        }
        self.record_event(TelemetryKind::OverlaysCleared, json!({}));
    }

    pub fn phase(&self) -> SelectionPhase {
        self.state.lock().phase
    }

    pub fn active_route(&self) -> Option<String> {
        self.state.lock().active_route.clone()
    }

    pub fn details(&self) -> Option<RutaDetails> {
        self.state.lock().details.clone()
    }

    pub fn saved_status(&self) -> SavedStatus {
        self.state.lock().saved
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn is_selecting(&self) -> bool {
        self.state.lock().selecting
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn with_map<R>(&self, read: impl FnOnce(&M) -> R) -> R {
        read(&self.map.lock().surface)
    }

    fn begin(&self, route_id: &str) -> (u64, AbortRegistration) {
        let mut state = self.state.lock();
        if let Some(previous) = state.abort.take() {
            previous.abort();
        }
        let (handle, registration) = AbortHandle::new_pair();
        state.generation += 1;
        state.abort = Some(handle);
        state.active_route = Some(route_id.to_string());
        state.details = None;
        state.drawn_by_handler = None;
        state.last_error = None;
        state.phase = SelectionPhase::Fetching;
        (state.generation, registration)
    }

    async fn fetch_route(&self, route_id: &str) -> AppResult<FetchedRoute> {
        let details = self.source.fetch_details(route_id).await?;
        let waypoints = finite_waypoints(&details);
        let (saved, line) = tokio::join!(
            self.fetch_saved_status(route_id),
            self.resolve_line(&waypoints)
        );
        Ok(FetchedRoute {
            details,
            saved,
            line,
        })
    }

    async fn fetch_saved_status(&self, route_id: &str) -> SavedStatus {
        match self.source.fetch_saved_status(route_id).await {
            Ok(status) => status.unwrap_or_default(),
            Err(err) => {
                warn!(target: "selection", route_id, ?err, "saved status unavailable");
                SavedStatus::default()
            }
        }
    }

    async fn resolve_line(&self, waypoints: &[Position]) -> Vec<Position> {
        match self.geometry.resolve(waypoints).await {
            Ok(line) if !line.is_empty() => line,
            Ok(_) => waypoints.to_vec(),
            Err(err) => {
                warn!(target: "selection", ?err, "geometry unavailable; drawing waypoints");
                waypoints.to_vec()
            }
        }
    }

    fn complete(&self, ticket: u64, route: FetchedRoute) -> SelectionOutcome {
        let mut state = self.state.lock();
        if state.generation != ticket {
            debug!(target: "selection", ticket, current = state.generation, "stale route load dropped");
            return SelectionOutcome::Superseded;
        }

        let route_id = route.details.id.clone();
        state.saved = route.saved;
        state.drawn_by_handler = Some(route_id.clone());
        let draw = self.draw(&route.details, &route.line);
        state.details = Some(route.details);
        state.phase = SelectionPhase::Drawn;
        state.finish();
        drop(state);

        info!(target: "selection", %route_id, ?draw, "route drawn");
        self.record_event(
            TelemetryKind::RouteDrawn,
            json!({ "route_id": route_id, "points": route.line.len() }),
        );
        SelectionOutcome::Drawn { draw }
    }

    fn fail(&self, ticket: u64, route_id: &str, err: AppError) -> SelectionOutcome {
        let message = err.to_string();
        {
            let mut state = self.state.lock();
            if state.generation != ticket {
                return SelectionOutcome::Superseded;
            }
            state.details = None;
            state.saved = SavedStatus::default();
            state.phase = SelectionPhase::Failed;
            state.last_error = Some(message.clone());
            state.finish();
        }
        warn!(target: "selection", route_id, ?err, "route load failed");
        self.record_event(
            TelemetryKind::RouteFetchFailed,
            json!({ "route_id": route_id, "error": message }),
        );
        SelectionOutcome::Failed { message }
    }

    fn draw(&self, details: &RutaDetails, line: &[Position]) -> DrawOutcome {
        let mut view = self.map.lock();
        let MapView { surface, sync } = &mut *view;
        sync.draw(surface, details, line)
    }

    fn record_event(&self, kind: TelemetryKind, payload: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.record(kind, payload) {
                warn!(target: "selection", ?err, "failed to queue telemetry event");
            }
        }
    }
}

fn finite_waypoints(details: &RutaDetails) -> Vec<Position> {
    details
        .coordenadas
        .iter()
        .copied()
        .filter(is_finite_position)
        .collect()
}
