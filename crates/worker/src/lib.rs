//! Queue worker for the ComfyUI face-swap workflow.
//!
//! Wires configuration, the per-job [`handler::Handler`], the health check
//! and the queue polling loop together. The binary in `main.rs` picks
//! between the queue loop and local test mode.

pub mod config;
pub mod handler;
pub mod health;
pub mod local;
pub mod panic_trace;
pub mod queue;
