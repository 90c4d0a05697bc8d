//! ComfyUI engine client for the face-swap worker.
//!
//! Provides the HTTP API wrapper, WebSocket connection and typed message
//! parsing, the completion wait loop, history output extraction, and the
//! supervisor that launches the engine process and waits for it to accept
//! requests.

pub mod api;
pub mod client;
pub mod completion;
pub mod history;
pub mod messages;
pub mod process;
