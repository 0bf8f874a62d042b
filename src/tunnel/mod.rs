//! Reverse tunnel between a cloud broker and a local LLM runtime.
//!
//! Provides two halves:
//!
//! - **Broker**: accepts agent registrations over WS ([`relay`]), keeps one
//!   live session per tenant ([`registry`]), and routes HTTP requests down
//!   the tenant's session ([`router`], [`pending`]) behind a per-tenant
//!   [`circuit`] breaker. [`health`] evicts silent sessions and expires
//!   overdue calls.
//! - **Agent**: dials out to the broker ([`client`], [`reconnect`]), replays
//!   requests against the loopback runtime ([`forwarder`]) and buffers its
//!   own outbound requests while disconnected ([`queue`]).
//!
//! Both speak the envelopes in [`protocol`], framed by [`codec`].

pub mod circuit;
pub mod client;
pub mod codec;
pub mod forwarder;
pub mod health;
pub mod metrics;
pub mod pending;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod relay;
pub mod router;
