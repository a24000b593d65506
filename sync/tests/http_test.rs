//! HTTP gateway against a mock WorkSpot API.

mod common;

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use workspot_engine::{BoundingBox, MutationRequest, PendingMutation};
use workspot_sync::{
    GatewayError, HttpGateway, LocalStore, ManualClock, PushOutcome, RemoteGateway, SyncEngine,
};

fn remote(id: &str, lat: f64, lon: f64) -> Value {
    serde_json::to_value(record(id, lat, lon).with_remote_updated_at(10)).unwrap()
}

async fn list_workspaces(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    match params.get("pageToken").map(String::as_str) {
        None => Json(json!({
            "records": [remote("duomo", 45.4642, 9.1900)],
            "tombstones": ["closed-spot"],
            "nextPageToken": "2",
        })),
        Some(_) => Json(json!({
            "records": [remote("galleria", 45.4659, 9.1900)],
        })),
    }
}

async fn get_workspace(Path(id): Path<String>) -> Response {
    match id.as_str() {
        "duomo" => Json(remote("duomo", 45.4642, 9.1900)).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn push_mutation(Json(mutation): Json<PendingMutation>) -> Response {
    match mutation.patch.name.as_deref() {
        Some("taken") => (
            StatusCode::CONFLICT,
            Json(json!({ "remote": remote(&mutation.record_id, 45.4642, 9.1900) })),
        )
            .into_response(),
        Some("") | Some("rude") => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "reason": "name not allowed" })),
        )
            .into_response(),
        Some("crash") => (StatusCode::INTERNAL_SERVER_ERROR, "database down").into_response(),
        _ => {
            let mut record = mutation
                .request()
                .apply(mutation.base.as_ref())
                .unwrap()
                .unwrap();
            record.remote_updated_at = 20;
            Json(json!({ "record": record })).into_response()
        }
    }
}

async fn saved_ids() -> Json<Value> {
    Json(json!({ "ids": ["duomo"] }))
}

/// Serve the mock API on an ephemeral port and return its base URL.
async fn serve() -> String {
    let app = Router::new()
        .route("/api/workspaces", get(list_workspaces))
        .route("/api/workspaces/{id}", get(get_workspace))
        .route("/api/mutations", post(push_mutation))
        .route("/api/saved", get(saved_ids));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api/")
}

async fn gateway() -> HttpGateway {
    HttpGateway::new(&serve().await, Duration::from_secs(2)).unwrap()
}

fn pending(name: &str) -> PendingMutation {
    let base = record("duomo", 45.4642, 9.1900);
    PendingMutation::new("m-1", MutationRequest::update("duomo", rename(name)), START, Some(base))
}

#[tokio::test]
async fn fetch_by_bounds_follows_pages() {
    let gateway = gateway().await;
    let bounds = BoundingBox::around(milan(), 1_000.0).unwrap();

    let first = gateway.fetch_by_bounds(&bounds, None).await.unwrap();
    assert_eq!(first.records[0].id, "duomo");
    assert_eq!(first.tombstones, vec!["closed-spot"]);
    assert_eq!(first.next_page_token.as_deref(), Some("2"));

    let second = gateway.fetch_by_bounds(&bounds, Some("2")).await.unwrap();
    assert_eq!(second.records[0].id, "galleria");
    assert!(second.tombstones.is_empty());
    assert!(second.next_page_token.is_none());
}

#[tokio::test]
async fn fetch_by_id_maps_404_to_none() {
    let gateway = gateway().await;
    let found = gateway.fetch_by_id("duomo").await.unwrap().unwrap();
    assert_eq!(found.remote_updated_at, 10);
    assert!(gateway.fetch_by_id("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn push_outcomes_follow_status_codes() {
    let gateway = gateway().await;

    let PushOutcome::Ack { record: Some(record) } = gateway.push(&pending("Duomo Desk")).await.unwrap()
    else {
        panic!("expected an ack with the stored record");
    };
    assert_eq!(record.name, "Duomo Desk");
    assert_eq!(record.remote_updated_at, 20);

    assert!(matches!(
        gateway.push(&pending("taken")).await.unwrap(),
        PushOutcome::Conflict { remote } if remote.id == "duomo"
    ));
    assert_eq!(
        gateway.push(&pending("rude")).await.unwrap(),
        PushOutcome::Rejected {
            reason: "name not allowed".into()
        }
    );
    assert!(matches!(
        gateway.push(&pending("crash")).await,
        Err(GatewayError::Remote { code: 500, message }) if message == "database down"
    ));
}

#[tokio::test]
async fn fetch_saved_ids() {
    let gateway = gateway().await;
    assert_eq!(gateway.fetch_saved_ids().await.unwrap(), vec!["duomo"]);
}

#[tokio::test]
async fn engine_syncs_over_http() {
    let gateway = Arc::new(gateway().await);
    let store = Arc::new(LocalStore::in_memory().await.unwrap());
    let engine = SyncEngine::start_with_clock(
        store,
        gateway,
        config(),
        Arc::new(ManualClock::new(START)),
    );

    let records = engine.nearby(milan(), 1_000.0).await.unwrap();
    let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["duomo", "galleria"]);

    let ticket = engine
        .submit_mutation(MutationRequest::update("duomo", rename("Duomo Desk")))
        .await
        .unwrap();
    let settled = within(ticket.outcome()).await.unwrap().unwrap();
    assert_eq!(settled.name, "Duomo Desk");
    assert_eq!(settled.remote_updated_at, 20);

    assert_eq!(engine.refresh_saved().await.unwrap(), 1);
    engine.shutdown().await;
}
