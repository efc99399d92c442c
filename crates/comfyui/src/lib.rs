//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, the shared WebSocket session with
//! per-prompt routing, HTTP API wrappers, server bootstrap, progress
//! tracking, and output retrieval for jobs submitted to a ComfyUI
//! image-generation server.

pub mod api;
pub mod client;
pub mod gateway;
pub mod launcher;
pub mod messages;
pub mod outputs;
pub mod session;
pub mod tracker;
