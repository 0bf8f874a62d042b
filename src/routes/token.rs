//! Credential refresh for an agent whose token the broker rejected.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::state::AgentState;

#[derive(Deserialize)]
pub struct TokenUpdate {
    pub token: String,
}

/// `POST /api/token`: replace the registration token. A client parked after
/// an authentication failure reconnects with the new one; a connected client
/// uses it on its next registration.
pub async fn update(State(state): State<AgentState>, Json(update): Json<TokenUpdate>) -> impl IntoResponse {
    let token = update.token.trim();
    if token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "token must not be empty", "code": "BAD_REQUEST"})),
        );
    }
    state.client.update_token(token);
    info!("Registration token replaced through the status server");
    (
        StatusCode::OK,
        Json(json!({"status": "updated", "state": state.client.state().as_str()})),
    )
}
