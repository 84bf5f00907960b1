//! Thin HTTP/WebSocket surface over the event store. Runs on its own
//! multi-thread tokio runtime in a dedicated OS thread so the core's
//! plain-thread inventory is unaffected.

use crate::store::EventStore;
use crate::ws::EventHub;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct AppState {
    store: Arc<EventStore>,
    hub: EventHub,
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(rename = "type")]
    event_type: Option<String>,
    since: Option<String>,
    pi: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(serde::Serialize)]
struct EventsPage {
    events: Vec<crate::rules::types::StationEvent>,
    total: i64,
}

async fn list_events(State(state): State<AppState>, Query(q): Query<EventsQuery>) -> impl IntoResponse {
    let store = state.store.clone();
    let limit = q.limit.unwrap_or(50);
    let offset = q.offset.unwrap_or(0).max(0);
    let result = tokio::task::spawn_blocking(move || store.query(q.event_type.as_deref(), q.since.as_deref(), limit, offset))
        .await
        .unwrap();
    match result {
        Ok((events, total)) => Json(EventsPage { events, total }).into_response(),
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn active_events(State(state): State<AppState>, Query(q): Query<EventsQuery>) -> impl IntoResponse {
    let store = state.store.clone();
    let Some(pi) = q.pi else {
        return (axum::http::StatusCode::BAD_REQUEST, "pi query param required").into_response();
    };
    let result = tokio::task::spawn_blocking(move || store.get_active_events(&pi)).await.unwrap();
    match result {
        Ok(events) => Json(events).into_response(),
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub.subscribe()))
}

async fn handle_socket(mut socket: WebSocket, mut rx: tokio::sync::broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Ok(json) => {
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
}

pub fn router(store: Arc<EventStore>, hub: EventHub) -> Router {
    let state = AppState { store, hub };
    Router::new()
        .route("/api/events", get(list_events))
        .route("/api/events/active", get(active_events))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawns the dedicated web thread, blocking that thread on its own tokio
/// runtime for the lifetime of the process.
pub fn spawn(port: u16, store: Arc<EventStore>, hub: EventHub) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("web".into())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("failed to build web runtime");
            rt.block_on(async move {
                let app = router(store, hub);
                let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
                match tokio::net::TcpListener::bind(addr).await {
                    Ok(listener) => {
                        if let Err(e) = axum::serve(listener, app).await {
                            tracing::error!(error = %e, "web server exited");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, port, "failed to bind web server"),
                }
            });
        })
        .expect("failed to spawn web thread")
}
