//! Agent status endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AgentState;

/// `GET /api/health`: liveness check with tunnel status.
///
/// Returns uptime, version, client state, queue depth and the tunnel's
/// connection statistics. No authentication; the status server binds to
/// loopback by default.
pub async fn health(State(state): State<AgentState>) -> Json<Value> {
    let client = &state.client;
    Json(json!({
        "status": "ok",
        "role": "agent",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "state": client.state().as_str(),
        "local_url": state.local_url,
        "queued": client.queued(),
        "tunnel": client.stats().to_json().await,
    }))
}
