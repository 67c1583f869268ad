mod common;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;

use mobzi_core::overlay::{Camera, DrawOutcome, HeadlessMap, MapSurface};
use mobzi_core::selection::{SelectionOutcome, SelectionPhase};
use mobzi_core::telemetry::TelemetryKind;

const DIRECTIONS_PATH: &str = "/directions/v5/mapbox/driving/-97.9,19.3;-97.85,19.25;-97.8,19.2";

fn expect_details(server: &Server, id: &str) {
    server.expect(
        Expectation::matching(request::method_path("GET", format!("/api/v1/rutas/{id}")))
            .respond_with(json_encoded(json!({
                "success": true,
                "data": {
                    "id": id,
                    "nombre": "Centro - Terminal",
                    "origen": "Centro",
                    "destino": "Terminal",
                    "costoMinimo": 9,
                    "costoMaximo": 12,
                    "moneda": "MXN",
                    "paradas": ["Centro", "Mercado", "Terminal"],
                    "coordenadas": [[-97.9, 19.3], [-97.85, 19.25], [-97.8, 19.2]],
                    "horarios": [{ "dia": "Lunes", "salidas": ["06:00", "06:30"] }]
                }
            }))),
    );
}

#[tokio::test]
async fn selected_route_is_drawn_along_the_road_geometry() {
    let server = Server::run();
    expect_details(&server, "r2");
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", DIRECTIONS_PATH),
            request::query(url_decoded(contains(("access_token", "pk.test")))),
        ))
        .respond_with(json_encoded(json!({
            "routes": [{ "geometry": { "coordinates": [
                [-97.9, 19.3], [-97.88, 19.28], [-97.85, 19.25], [-97.82, 19.22], [-97.8, 19.2]
            ] } }]
        }))),
    );

    let (state, _data_dir) = common::app_state(&server, Some("pk.test"));
    let controller = state.selection_controller(HeadlessMap::new());

    let outcome = controller.select("r2").await;
    assert_eq!(
        outcome,
        SelectionOutcome::Drawn {
            draw: DrawOutcome::Drawn { points: 5, markers: 3 }
        }
    );
    assert_eq!(controller.phase(), SelectionPhase::Drawn);
    // Signed out: no saved-status request, flags stay cleared.
    assert!(!controller.saved_status().guardada);

    controller.with_map(|map| {
        assert_eq!(map.source("route-source-r2").unwrap().len(), 5);
        assert_eq!(map.layer("route-line-r2").unwrap().color, "#FFD700");
        let popups: Vec<_> = map.markers().iter().map(|m| m.popup.clone()).collect();
        assert_eq!(popups, vec!["Centro", "Mercado", "Terminal"]);
        assert!(matches!(map.camera(), Some(Camera::FitBounds { padding: 60, .. })));
    });

    let kinds: Vec<_> = state.telemetry().recent().iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&TelemetryKind::RouteSelected));
    assert!(kinds.contains(&TelemetryKind::RouteDrawn));
}

#[tokio::test]
async fn routing_failure_falls_back_to_stop_coordinates() {
    let server = Server::run();
    expect_details(&server, "r1");
    server.expect(
        Expectation::matching(request::method_path("GET", DIRECTIONS_PATH))
            .respond_with(status_code(503)),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/api/v1/rutas/r1/guardada"),
            request::headers(contains(("authorization", "Bearer rider-token"))),
        ))
        .respond_with(json_encoded(json!({
            "success": true,
            "data": { "guardada": true, "favorita": false }
        }))),
    );

    let (state, _data_dir) = common::app_state(&server, Some("pk.test"));
    state.store_session_token("rider-token").unwrap();
    let controller = state.selection_controller(HeadlessMap::new());

    let outcome = controller.select("r1").await;
    assert_eq!(
        outcome,
        SelectionOutcome::Drawn {
            draw: DrawOutcome::Drawn { points: 3, markers: 3 }
        }
    );
    assert!(controller.saved_status().guardada);
    controller.with_map(|map| {
        assert_eq!(map.layer("route-line-r1").unwrap().color, "#00BFFF");
        assert_eq!(map.source("route-source-r1").unwrap().len(), 3);
    });
}

#[tokio::test]
async fn missing_route_leaves_the_map_empty() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/api/v1/rutas/nope")).respond_with(
            status_code(404)
                .append_header("content-type", "application/json")
                .body(r#"{"success":false,"message":"Ruta no encontrada"}"#),
        ),
    );

    let (state, _data_dir) = common::app_state(&server, None);
    let controller = state.selection_controller(HeadlessMap::new());

    match controller.select("nope").await {
        SelectionOutcome::Failed { message } => assert!(message.contains("Ruta no encontrada")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(controller.phase(), SelectionPhase::Failed);
    assert!(controller.details().is_none());
    assert!(controller.with_map(|map| map.layer_ids().is_empty()));

    controller.clear();
    assert_eq!(controller.phase(), SelectionPhase::Idle);
    let kinds: Vec<_> = state.telemetry().recent().iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&TelemetryKind::RouteFetchFailed));
    assert!(kinds.contains(&TelemetryKind::OverlaysCleared));
}
