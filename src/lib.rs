#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! llm-tunnel library: the broker and agent halves of the tunnel.
//!
//! - `tunnel`: protocol, broker (registry, router, circuit breaker, health
//!   sweep, HTTP surface) and agent (client, queue, local forwarder)
//! - `auth`: registration JWT validation and bearer-key middleware
//! - `config`: TOML + env-var configuration
//! - `routes`: the agent's local status server
//! - `state`: agent connection statistics

pub mod auth;
pub mod config;
pub mod routes;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use auth::{ApiKey, TokenValidator};
pub use config::Config;
pub use state::{AgentState, TunnelStats};
pub use tunnel::client::{TunnelClient, TunnelClientHandle};
pub use tunnel::registry::SessionRegistry;
pub use tunnel::relay::BrokerState;
pub use tunnel::router::TunnelBroker;
