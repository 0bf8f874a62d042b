//! Agent-originated requests toward the broker.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use crate::state::AgentState;
use crate::tunnel::client::ClientError;
use crate::tunnel::protocol::{Priority, RequestEnvelope};

#[derive(Deserialize)]
pub struct OutboundRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// UTF-8 body, sent as-is.
    pub body: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

/// `POST /api/outbound`: queue a request for the broker. It is sent as soon
/// as the tunnel is connected.
pub async fn enqueue(State(state): State<AgentState>, Json(req): Json<OutboundRequest>) -> impl IntoResponse {
    let priority = match req.priority.as_deref().map(Priority::parse) {
        None => Priority::Normal,
        Some(Some(p)) => p,
        Some(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "priority must be high, normal or low", "code": "BAD_REQUEST"})),
            );
        }
    };
    let mut envelope = RequestEnvelope::new(req.method, req.path).with_priority(priority);
    envelope.headers = req.headers;
    if let Some(body) = req.body {
        envelope = envelope.with_body(body.into_bytes());
    }
    let correlation_id = envelope.correlation_id.clone();

    match state.client.enqueue(envelope).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({"correlation_id": correlation_id, "queued": state.client.queued()})),
        ),
        Err(e @ ClientError::QueueFull { .. }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.to_string(), "code": "QUEUE_FULL", "correlation_id": correlation_id})),
        ),
        Err(e @ ClientError::Closed) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.to_string(), "code": "SHUTTING_DOWN"})),
        ),
    }
}
