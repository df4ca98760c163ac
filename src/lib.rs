//! # llm-router-proxy
//!
//! A transparent streaming reverse proxy for LLM chat APIs. A client speaks
//! either the Anthropic `/v1/messages` protocol or the OpenAI
//! `/v1/chat/completions` protocol; the proxy terminates the client
//! connection, inspects and optionally rewrites the request body, selects a
//! backend model from a tiered policy, forwards to the chosen provider, and
//! streams the response back — extracting token-usage accounting from the
//! stream as it passes through.
//!
//! ## Modules
//! - `api`: the HTTP front end (`serve`) and the proxy pipeline handler.
//! - `router`: tiered config, target resolution, budget and quota tracking,
//!   and request classification.
//! - `bridge`: Anthropic ↔ OpenAI request/response/stream translation.
//! - `sse`: the stateful SSE usage extractor.
//! - `guard`: the hidden-Unicode pre-guard and the external content-guard
//!   client.
//! - `context`: `AppContext`, the application state built once at startup.
//! - `config`: flat environment configuration.
//! - `error`: the proxy-wide error taxonomy and its HTTP representation.

pub mod api;
pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod router;
pub mod sse;

pub use config::AppConfig;
pub use context::AppContext;
