//! HTTP/SSE boundary (spec §6 external interface, client side).
//!
//! Thin axum wiring over the orchestrator: one REST endpoint for a
//! non-streaming turn, one SSE endpoint for a streamed turn, and a health
//! check. No business logic lives here.

mod http;

pub use http::{AppState, create_router};
