//! Agent-side HTTP route handlers.
//!
//! The agent's optional status server is meant for loopback use only and
//! carries no authentication.

pub mod health;
pub mod outbound;
pub mod token;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AgentState;

/// Build the agent status router.
pub fn agent_router(state: AgentState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/outbound", post(outbound::enqueue))
        .route("/api/token", post(token::update))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
