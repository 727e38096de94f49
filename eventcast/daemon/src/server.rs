//! HTTP Front End
//!
//! Routes served by the daemon:
//!
//! ```text
//! GET    /events                 event stream (one client per request)
//! POST   /broadcast              JSON body sent to every client
//! GET    /clients                snapshots of all clients
//! GET    /clients/{id}           snapshot of one client
//! DELETE /clients/{id}           disconnect a client
//! POST   /clients/{id}/messages  queue a targeted message
//! POST   /clients/{id}/activity  report inbound traffic from a client
//! GET    /health                 liveness and client count
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use eventcast_core::{
    transport::DEFAULT_STREAM_CAPACITY, ChannelSink, ClientId, ConnectionRequest, ManagerError,
    MessagePriority, OutboundMessage, SseManager,
};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    manager: SseManager,
}

/// Body of `POST /clients/{id}/messages`
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    /// `event:` name
    #[serde(default)]
    pub event: Option<String>,
    /// Payload
    pub data: Value,
    /// Eviction priority
    #[serde(default)]
    pub priority: Option<MessagePriority>,
    /// Overrides the retention period
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

impl SendRequest {
    fn into_message(self) -> OutboundMessage {
        let mut message = OutboundMessage::new(self.data);
        message.event = self.event;
        if let Some(priority) = self.priority {
            message = message.with_priority(priority);
        }
        if let Some(ttl) = self.ttl_ms {
            message = message.with_ttl(Duration::from_millis(ttl));
        }
        message
    }
}

/// Build the router around `manager`
pub fn router(manager: SseManager) -> Router {
    Router::new()
        .route("/events", get(events))
        .route("/broadcast", post(broadcast))
        .route("/clients", get(list_clients))
        .route("/clients/{id}", get(get_client).delete(disconnect_client))
        .route("/clients/{id}/messages", post(send_message))
        .route("/clients/{id}/activity", post(client_activity))
        .route("/health", get(health))
        .with_state(AppState { manager })
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn unknown_client(id: &ClientId) -> axum::response::Response {
    error_response(StatusCode::NOT_FOUND, format!("unknown client '{id}'"))
}

fn connection_request(headers: &HeaderMap) -> ConnectionRequest {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .fold(ConnectionRequest::new(), |request, (name, value)| {
            request.with_header(name, value)
        })
}

async fn events(State(state): State<AppState>, headers: HeaderMap) -> axum::response::Response {
    let request = connection_request(&headers);
    let (sink, stream) = ChannelSink::pair(DEFAULT_STREAM_CAPACITY);

    if let Err(e) = state.manager.handle_connection(&request, Arc::new(sink)).await {
        let status = match e {
            ManagerError::CapacityExceeded { .. } | ManagerError::ShutDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        return error_response(status, e.to_string());
    }

    let head = stream.head();
    let mut builder = Response::builder().status(head.status);
    for (name, value) in &head.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Body::from_stream(stream)).unwrap_or_else(|e| {
        error!(error = %e, "Failed to build event-stream response");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid response head")
    })
}

async fn broadcast(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> axum::response::Response {
    let result = state.manager.broadcast(&payload).await;
    info!(
        successful = result.successful,
        failed = result.failed,
        "Broadcast requested over HTTP"
    );
    Json(result).into_response()
}

async fn list_clients(State(state): State<AppState>) -> axum::response::Response {
    Json(state.manager.client_snapshots().await).into_response()
}

async fn get_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = ClientId::from(id);
    match state.manager.client_snapshot(&id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => unknown_client(&id),
    }
}

async fn disconnect_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = ClientId::from(id);
    if state.manager.disconnect_client(&id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        unknown_client(&id)
    }
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> axum::response::Response {
    let id = ClientId::from(id);
    if state.manager.client_snapshot(&id).await.is_none() {
        return unknown_client(&id);
    }

    let delivered = state
        .manager
        .send_to_client(&id, request.into_message())
        .await;
    debug!(client_id = %id, delivered, "Targeted message accepted");
    let status = if delivered {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(json!({ "delivered": delivered }))).into_response()
}

async fn client_activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> axum::response::Response {
    let id = ClientId::from(id);
    if state.manager.record_client_activity(&id, body.len()).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        unknown_client(&id)
    }
}

async fn health(State(state): State<AppState>) -> axum::response::Response {
    Json(json!({
        "status": if state.manager.is_shut_down() { "shutting_down" } else { "ok" },
        "clients": state.manager.client_count(),
    }))
    .into_response()
}
