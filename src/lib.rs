#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Too noisy here: the session types live in `sessions`, most of the public
// surface is getters, and journal file names (`in.jsonl`, `metadata.json`)
// trip the doc-markdown heuristic on every module header.
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
// `map_err(|e| e.to_string())` everywhere engine errors cross the transport
// boundary.
#![allow(clippy::redundant_closure_for_method_calls)]

//! abridge library — the session engine and its transports.
//!
//! This library exposes the key building blocks:
//! - `sessions` — the durable session engine: registry, status machine,
//!   journals, transform pipeline, observers, hydration
//! - `mux` — terminal-multiplexer adapter hosting supervisor loops
//! - `supervisor` — the shell restart/backoff loop rendered per session
//! - `config` — configuration loading
//! - `routes` — REST API route handlers
//! - `ws` — WebSocket observer transport

pub mod config;
pub mod mux;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod supervisor;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use sessions::{SessionEngine, SessionSummary};
pub use state::AppState;
