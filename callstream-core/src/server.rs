//! HTTP/WebSocket surface.
//!
//! Thin transport over the façade: packet ingest and completion as POSTs,
//! a read-only call snapshot, and a WebSocket that pushes each bus event as
//! one JSON text frame. Nothing here mutates state directly; the engine owns
//! all of that behind the façade.

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::engine::CallEngine;
use crate::error::CoreError;
use crate::events::EventBus;
use crate::facade::{CompleteBody, IngestFacade, PacketBody};

#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<IngestFacade>,
    pub engine: Arc<CallEngine>,
    pub bus: Arc<EventBus>,
}

/// `Json` extractor that reports every body problem as a 422.
///
/// Axum's stock `Json` rejects malformed or mistyped bodies with a 400
/// before the handler runs; the ingest contract promises a validation error
/// for any invalid input, so deserialization failures get the same status
/// as the façade's field checks.
struct ValidatedJson<T>(T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/calls/:call_id/packets", post(ingest_packet))
        .route("/calls/:call_id/complete", post(complete_call))
        .route("/calls/:call_id", get(get_call))
        .route("/events", get(subscribe_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ingest_packet(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    ValidatedJson(body): ValidatedJson<PacketBody>,
) -> Response {
    match state.facade.ingest_packet(&call_id, body).await {
        Ok(response) => (StatusCode::ACCEPTED, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn complete_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    ValidatedJson(body): ValidatedJson<CompleteBody>,
) -> Response {
    match state.facade.complete_call(&call_id, body).await {
        Ok(response) => (StatusCode::ACCEPTED, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_call(State(state): State<AppState>, Path(call_id): Path<String>) -> Response {
    match state.engine.call(&call_id).await {
        Ok(Some(call)) => Json(call).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown call" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn subscribe_events(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| pump_events(socket, state.bus.clone()))
}

/// Forward bus events to one WebSocket client until either side goes away.
/// If the bus drops us (queue overflow) the stream simply ends; there is no
/// replay on reconnect.
async fn pump_events(socket: WebSocket, bus: Arc<EventBus>) {
    let mut subscription = bus.subscribe();
    let subscriber = subscription.id();
    info!(subscriber = %subscriber, "event subscriber connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    debug!(subscriber = %subscriber, "bus closed this subscription");
                    break;
                };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(subscriber = %subscriber, error = %e, "could not encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                // Inbound frames are ignored; only disconnects matter.
                match frame {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    bus.unsubscribe(subscriber);
    info!(subscriber = %subscriber, "event subscriber disconnected");
}

/// Validation problems echo their message with a 422; anything else is an
/// opaque 500 so internal state never leaks to the PBX side.
fn error_response(err: CoreError) -> Response {
    if err.is_caller_safe() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response();
    }
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::SimulatedAnalyzer;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{header, Request as HttpRequest};
    use tower::ServiceExt;

    fn app() -> Router {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::shared();
        let engine = CallEngine::new(store, bus.clone(), Arc::new(SimulatedAnalyzer::new()));
        let facade = Arc::new(IngestFacade::new(engine.clone()));
        router(AppState { facade, engine, bus })
    }

    async fn post(app: Router, uri: &str, body: &str) -> StatusCode {
        let request = HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn bodies_that_do_not_deserialize_get_422() {
        let cases = [
            ("/calls/c1/packets", "{ not json"),
            ("/calls/c1/packets", r#"{"sequence":"abc","data":"x","timestamp":1.0}"#),
            ("/calls/c1/packets", r#"{"sequence":1.5,"data":"x","timestamp":1.0}"#),
            ("/calls/c1/packets", r#"{"data":"x"}"#),
            ("/calls/c1/packets", ""),
            ("/calls/c1/complete", r#"{"total_packets":"three"}"#),
            ("/calls/c1/complete", "{}"),
        ];
        for (uri, body) in cases {
            assert_eq!(
                post(app(), uri, body).await,
                StatusCode::UNPROCESSABLE_ENTITY,
                "expected 422 for {uri} body {body:?}"
            );
        }
    }

    #[tokio::test]
    async fn facade_validation_failures_also_get_422() {
        assert_eq!(
            post(
                app(),
                "/calls/c1/packets",
                r#"{"sequence":-1,"data":"x","timestamp":1.0}"#
            )
            .await,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            post(app(), "/calls/c1/complete", r#"{"total_packets":0}"#).await,
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[tokio::test]
    async fn well_formed_requests_are_accepted() {
        let app = app();
        assert_eq!(
            post(
                app.clone(),
                "/calls/c1/packets",
                r#"{"sequence":0,"data":"hello","timestamp":1.0}"#
            )
            .await,
            StatusCode::ACCEPTED
        );
        assert_eq!(
            post(app, "/calls/c1/complete", r#"{"total_packets":1}"#).await,
            StatusCode::ACCEPTED
        );
    }
}
