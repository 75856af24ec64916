//! Observability engine for HTTP(S) and WebSocket traffic produced by an
//! embedded browsing surface.
//!
//! The crate intercepts every network transaction a browsing session
//! produces through the host's lifecycle callbacks, normalizes request and
//! response metadata, correlates pre-flights with their real requests,
//! extracts security-relevant artifacts (bearer tokens, CORS grants,
//! cookies), optionally persists response bodies, and emits both per-event
//! records and aggregated transactions to an inspector sink and to on-disk
//! archives (HAR for REST, NDJSON for WebSocket frames and transactions).
//!
//! The pipeline is strictly pass-through: it never withholds, reorders, or
//! modifies the bytes the host delivers, and no failure inside it
//! terminates capture.

pub mod aggregator;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod controller;
pub mod engine;
pub mod events;
pub mod har;
pub mod recorder;
pub mod redact;
pub mod util;
